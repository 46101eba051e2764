//! Build script rendering the `keel` manual pages.
//!
//! Produces `keel.1` for the top-level command plus one `keel-<subcommand>.1`
//! page per subcommand in the build output directory, for packaging next to
//! the binary.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const MANUAL: &str = "keel manual";

fn source() -> String {
    format!("keel {}", env!("CARGO_PKG_VERSION"))
}

fn render(page: Man, out_dir: &Path, file_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = Vec::new();
    page.render(&mut buffer)?;
    fs::write(out_dir.join(file_name), buffer)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    for subcommand in command.get_subcommands() {
        let title = format!("keel-{}", subcommand.get_name());
        let page = Man::new(subcommand.clone())
            .title(title.as_str())
            .manual(MANUAL)
            .source(source());
        render(page, &out_dir, &format!("{title}.1"))?;
    }
    render(
        Man::new(command).manual(MANUAL).source(source()),
        &out_dir,
        "keel.1",
    )
}
