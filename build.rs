//! Build script for generating the `kiln` manual pages.
//!
//! Packaging picks up `kiln.1` plus one page per subcommand
//! (`kiln-build.1`, `kiln-validate.1`) from the build output directory.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(
    command: clap::Command,
    title: &str,
    target: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut page = Vec::new();
    Man::new(command).title(title).render(&mut page)?;
    fs::write(target, page)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
    })?);

    let root = Cli::command();
    for sub in root.get_subcommands() {
        let name = format!("kiln-{}", sub.get_name());
        render(sub.clone(), &name, &out_dir.join(format!("{name}.1")))?;
    }
    render(root, "kiln", &out_dir.join("kiln.1"))
}
