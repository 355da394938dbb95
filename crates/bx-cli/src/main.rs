use clap::Parser;
use color_eyre::Result;

mod cli;
mod dispatch;
mod output;

use cli::BxCli;
use output::CommandStatus;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = BxCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let outcome = dispatch::dispatch(&cli);
    let name = dispatch::command_name(&cli.command);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome.to_json(name))?);
    } else if outcome.status == CommandStatus::Ok {
        if !cli.quiet {
            println!("bx {name}: {}", outcome.message);
            for line in outcome.human_lines() {
                println!("  {line}");
            }
        }
    } else {
        let code = outcome
            .details
            .get("code")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(bx_core::diagnostics::GENERIC);
        eprintln!("bx {name}: error[{code}]: {}", outcome.message);
    }

    let code = outcome.exit_code();
    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("bx_core={level},bx_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
