//! Smoke test for the bridge: works without a running terminal, in which case
//! the response is `null`.
//!
//! Usage: mt5bridge [REQUEST_JSON] [PYTHON_HOME]

use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_REQUEST: &str = r#"{"method":"get_m1_bars","symbol":"EURUSD","count":1}"#;

fn main() -> ExitCode {
    mt5bridge::init_logging("info");

    let mut args = std::env::args().skip(1);
    let request = args.next().unwrap_or_else(|| DEFAULT_REQUEST.to_string());
    let home = args.next().map(PathBuf::from);

    log::info!("mt5bridge smoke test starting...");

    let bridge = mt5bridge::get_bridge();
    if let Err(e) = bridge.initialize(home.as_deref()) {
        eprintln!("Initialization failed: {}", e);
        return ExitCode::FAILURE;
    }
    log::info!("bridge initialized");

    let outcome = mt5bridge::codec::decode_request(&request)
        .and_then(|request| bridge.eval(&request))
        .and_then(|response| mt5bridge::codec::encode_pretty(&response));

    let code = match outcome {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!(
                "mt5bridge eval failed: {}",
                bridge.last_error().unwrap_or_else(|| e.to_string())
            );
            ExitCode::FAILURE
        }
    };

    let _ = bridge.shutdown();
    code
}
