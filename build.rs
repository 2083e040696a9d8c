//! Renders man pages for `ferry-volume` and each of its subcommands into the
//! build output directory, where packaging picks them up.

use std::env;
use std::io::Write;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_path = Utf8PathBuf::from(env::var("OUT_DIR")?);
    let out_dir = Dir::open_ambient_dir(&out_path, ambient_authority())?;

    let command = cli::Cli::command();
    let name = command.get_name().to_owned();
    for subcommand in command.get_subcommands() {
        let page = format!("{name}-{}", subcommand.get_name());
        let rendered = render(&Man::new(subcommand.clone()).title(page.to_uppercase()))?;
        out_dir.write(format!("{page}.1"), rendered)?;
    }
    out_dir.write(format!("{name}.1"), render(&Man::new(command))?)?;
    Ok(())
}

fn render(page: &Man) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    page.render(&mut buffer)?;
    Ok(buffer)
}
