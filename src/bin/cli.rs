use anyhow::{bail, Context};
use focusstack::config::{JobConfig, StackConfig};
use focusstack::focus_stack::JobStatus;
use focusstack::progress::CancelFlag;
use std::env;
use std::fs;
use std::sync::atomic::Ordering;

fn main() -> anyhow::Result<()> {
    focusstack::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: focusstack-cli <run|stack|default-config> [args]");
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "run" => cmd_run(&args),
        "stack" => cmd_stack(&args),
        "default-config" => cmd_default_config(&args),
        _ => {
            eprintln!("Unknown command: {}", command);
            std::process::exit(1);
        }
    }
}

fn cancel_on_ctrlc() -> anyhow::Result<CancelFlag> {
    let flag = CancelFlag::new();
    let handle = flag.handle();
    ctrlc::set_handler(move || {
        eprintln!("Stopping after the current frame...");
        handle.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(flag)
}

fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    // run <config.toml> [--report <file.json>]
    let mut config_path = None;
    let mut report_path = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--report" => {
                i += 1;
                report_path = Some(args.get(i).context("--report needs a file")?.clone());
            }
            other => {
                if config_path.is_none() {
                    config_path = Some(other.to_string());
                } else {
                    bail!("Unexpected argument: {}", other);
                }
            }
        }
        i += 1;
    }

    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Usage: focusstack-cli run <config.toml> [--report <file.json>]");
            std::process::exit(1);
        }
    };

    let config = StackConfig::load_from_file(&config_path)?;
    let mut runner = config.runner()?;
    let mut progress = cancel_on_ctrlc()?;
    let report = runner.run_all(&mut progress);

    for job in &report.jobs {
        match job.status {
            JobStatus::Completed => println!("{}: completed ({} ms)", job.job, job.elapsed_ms),
            _ => println!(
                "{}: {:?}: {}",
                job.job,
                job.status,
                job.error.as_deref().unwrap_or("")
            ),
        }
    }
    if let Some(path) = report_path {
        fs::write(&path, report.to_json()?).with_context(|| format!("writing {}", path))?;
    }

    if report.failed() > 0 || report.cancelled() {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_stack(args: &[String]) -> anyhow::Result<()> {
    // stack <working_dir> <input_subdir> [--no-align] [--no-balance]
    let mut positional = Vec::new();
    let mut align = true;
    let mut balance = true;
    for arg in &args[2..] {
        match arg.as_str() {
            "--no-align" => align = false,
            "--no-balance" => balance = false,
            other => positional.push(other.to_string()),
        }
    }
    if positional.len() != 2 {
        eprintln!("Usage: focusstack-cli stack <working_dir> <input_subdir> [--no-align] [--no-balance]");
        std::process::exit(1);
    }

    let mut job = JobConfig::standard("stack", &positional[0], &positional[1], align, balance).build()?;
    let mut progress = cancel_on_ctrlc()?;
    let report = job.run(&mut progress)?;
    for stage in &report.stages {
        println!(
            "{}: {} written, {} dropped ({} ms)",
            stage.stage, stage.frames_written, stage.frames_dropped, stage.elapsed_ms
        );
    }
    Ok(())
}

fn cmd_default_config(args: &[String]) -> anyhow::Result<()> {
    let path = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| StackConfig::default_path().display().to_string());
    StackConfig::default().save_to_file(&path)?;
    println!("Wrote {}", path);
    Ok(())
}
