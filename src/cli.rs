use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sensor-relay",
    version,
    about = "Relays rtl_433 sensor readings into a metrics backend"
)]
pub struct Args {
    /// YAML (or JSON) configuration document.
    pub config: PathBuf,
}

impl Args {
    // Usage errors exit 1, not clap's 2.
    pub fn parse_or_exit() -> Self {
        match Self::try_parse() {
            Ok(args) => args,
            Err(err) => match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => err.exit(),
                _ => {
                    let _ = err.print();
                    std::process::exit(1);
                }
            },
        }
    }
}
