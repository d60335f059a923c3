use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{emit, OutputFormat, Report};

#[derive(Serialize)]
struct VersionOutput {
    name: &'static str,
    version: &'static str,
    target: &'static str,
    target_os: &'static str,
    target_arch: &'static str,
    ciphers: Vec<&'static str>,
}

impl Report for VersionOutput {
    fn title(&self) -> &'static str {
        "Build"
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Name", self.name.to_string()),
            ("Version", self.version.to_string()),
            ("Target", self.target.to_string()),
            ("OS", self.target_os.to_string()),
            ("Arch", self.target_arch.to_string()),
            ("Cipher stages", self.ciphers.join(", ")),
        ]
    }
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("tunplex {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    emit(
        &VersionOutput {
            name: "tunplex",
            version: env!("CARGO_PKG_VERSION"),
            target: option_env!("TUNPLEX_BUILD_TARGET").unwrap_or("unknown"),
            target_os: std::env::consts::OS,
            target_arch: std::env::consts::ARCH,
            ciphers: vec!["aes", "chacha20", "speck128", "speck256", "crc32c", "lz4"],
        },
        format,
    );
    Ok(SUCCESS)
}
