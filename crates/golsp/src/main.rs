//
// main.rs
//
// Command-line entry point
//

use std::env;

use golsp::backend;

fn print_usage() {
    println!("golsp {}, a Go language server.", env!("CARGO_PKG_VERSION"));
    print!(
        r#"
Usage: golsp [OPTIONS]

Available options:

--stdio                      Start the LSP server using stdio transport
--listen <ADDR>              Accept LSP connections over TCP on ADDR (e.g. 127.0.0.1:9257)
--version                    Print the version
--help                       Print this help message

"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut argv = env::args();
    argv.next(); // skip executable name

    let mut use_stdio = false;
    let mut listen_addr: Option<String> = None;

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--stdio" => use_stdio = true,
            "--listen" => match argv.next() {
                Some(addr) => listen_addr = Some(addr),
                None => return Err(anyhow::anyhow!("--listen requires an address")),
            },
            "--version" => {
                println!("golsp {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_usage();
                return Ok(());
            }
            other => {
                return Err(anyhow::anyhow!("Unknown argument: '{other}'"));
            }
        }
    }

    env_logger::init();

    match (use_stdio, listen_addr) {
        (true, Some(_)) => Err(anyhow::anyhow!("--stdio and --listen are mutually exclusive")),
        (true, None) => backend::start_lsp().await,
        (false, Some(addr)) => backend::listen(&addr).await,
        (false, None) => {
            print_usage();
            Ok(())
        }
    }
}
