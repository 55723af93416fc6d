//! Headless launcher.
//!
//! Parses the CLI surface, initialises logging, discovers env-var accounts,
//! and opens a `.bskc` argument if one was given.  Window management, the
//! single-instance guard, and IPC forwarding live in the host shell.

use clap::Parser;

use basilisk::account::AccountManager;
use basilisk::archive::open_bskc;
use basilisk::cli::Cli;

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level.to_filter())
        .init();

    if let Some(language) = &cli.language {
        log::info!("requested UI language: {}", language);
    }

    let accounts = AccountManager::from_env(!cli.no_env_account);
    log::info!("discovered {} account(s)", accounts.len());

    if let Some(path) = &cli.path {
        match open_bskc(path) {
            Ok(opened) => {
                let title = opened
                    .conversation
                    .title
                    .as_deref()
                    .unwrap_or("(untitled)");
                println!(
                    "{}: {} block(s), {} system prompt(s){}",
                    title,
                    opened.conversation.messages.len(),
                    opened.conversation.systems.len(),
                    if opened.draft.is_some() {
                        ", draft pending"
                    } else {
                        ""
                    }
                );
                for warning in &opened.warnings {
                    log::warn!("{}", warning);
                }
            }
            Err(err) => {
                eprintln!("cannot open {}: {}", path.display(), err);
            }
        }
    }
}
