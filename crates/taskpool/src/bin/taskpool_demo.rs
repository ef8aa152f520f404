//! Demo host for taskpool. Also serves as its own manager and worker binary.
//!
//! Run with: cargo run --bin taskpool-demo -- [increment|chain|kill|all] [--pool-size N]

use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use taskpool::registry::demo;
use taskpool::{
    CommandSpawner, ManagerConfig, ManagerProxy, StagedTask, TaskCallback, TaskSpec, Verb,
};

const WAIT: Duration = Duration::from_secs(30);

fn main() {
    if let Some(result) = taskpool::run_if_child(demo::registry()) {
        if let Err(e) = result {
            eprintln!("error: {e}");
            process::exit(1);
        }
        return;
    }

    taskpool::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let (scenario, pool_size) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: taskpool-demo [increment|chain|kill|all] [--pool-size N]");
            process::exit(2);
        }
    };

    if let Err(e) = run(&scenario, pool_size) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<(String, Option<usize>), String> {
    let mut scenario: Option<String> = None;
    let mut pool_size = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--pool-size" => {
                i += 1;
                let raw = args.get(i).ok_or("--pool-size requires a value")?;
                pool_size = Some(
                    raw.parse::<usize>()
                        .map_err(|_| format!("invalid pool size '{raw}'"))?,
                );
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if scenario.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                scenario = Some(arg.to_string());
            }
        }
        i += 1;
    }

    Ok((scenario.unwrap_or_else(|| "all".to_string()), pool_size))
}

fn run(scenario: &str, pool_size: Option<usize>) -> Result<()> {
    let mut config = ManagerConfig::from_env().with_name("demo-manager");
    if let Some(n) = pool_size {
        config = config.with_pool_size(n);
    }

    match scenario {
        "increment" => increment(&config),
        "chain" => chain(&config),
        "kill" => kill(&config),
        "all" => {
            increment(&config)?;
            chain(&config)?;
            kill(&config)
        }
        other => bail!("unknown scenario '{other}'"),
    }
}

fn start(config: &ManagerConfig) -> Result<ManagerProxy> {
    let spawner = CommandSpawner::current_process().context("locating current executable")?;
    ManagerProxy::start(config.clone(), Arc::new(spawner)).context("starting manager")
}

fn increment(config: &ManagerConfig) -> Result<()> {
    let mut proxy = start(config)?;
    let result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);

    proxy.schedule_task(TaskCallback::new(
        TaskSpec::new("increment", json!(0)),
        move |value| *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value),
    ))?;

    if !proxy.wait_idle(WAIT) {
        bail!("increment did not finish within {WAIT:?}");
    }
    let value = result.lock().unwrap_or_else(|e| e.into_inner()).take();
    tracing::info!(?value, "increment finished");
    proxy.terminate();
    Ok(())
}

fn chain(config: &ManagerConfig) -> Result<()> {
    let mut proxy = start(config)?;

    let ids = proxy.schedule_tasks([
        (
            "task1",
            StagedTask::new(TaskCallback::new(TaskSpec::new("constant", json!(2)), |value| {
                tracing::info!(%value, "task1 finished");
            })),
        ),
        (
            "task2",
            StagedTask::new(TaskCallback::new(
                TaskSpec::new("increment", Value::Null),
                |value| tracing::info!(%value, "task2 finished"),
            ))
            .after(["task1"]),
        ),
    ])?;
    tracing::debug!(?ids, "Chain submitted");

    if !proxy.wait_idle(WAIT) {
        bail!("chain did not finish within {WAIT:?}");
    }
    if !proxy.join(WAIT) {
        bail!("pool did not drain");
    }
    proxy.terminate();
    Ok(())
}

fn kill(config: &ManagerConfig) -> Result<()> {
    let mut proxy = start(&config.clone().with_request_timeout(Duration::from_millis(500)))?;
    proxy.kill();

    if proxy.is_alive() {
        bail!("manager still alive after kill");
    }
    match proxy.make_request(Verb::GetStatus, None) {
        Ok(status) => bail!("killed manager answered with {status}"),
        Err(e) => tracing::info!(error = %e, "Killed manager no longer answers"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        std::iter::once("taskpool-demo")
            .chain(raw.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_to_all() {
        assert_eq!(parse_args(&args(&[])).unwrap(), ("all".to_string(), None));
    }

    #[test]
    fn parses_pool_size() {
        assert_eq!(
            parse_args(&args(&["chain", "--pool-size", "3"])).unwrap(),
            ("chain".to_string(), Some(3))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&["--pool-size"])).is_err());
        assert!(parse_args(&args(&["--pool-size", "x"])).is_err());
        assert!(parse_args(&args(&["a", "b"])).is_err());
        assert!(parse_args(&args(&["--verbose"])).is_err());
    }
}
