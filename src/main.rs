/// sptscript CLI
/// `sptscript <file>` — compile and interpret a script, or execute a
/// pre-compiled `.flxc` chunk. Exit code 0 on success, non-zero on any
/// compile or runtime error.

use clap::Parser as ClapParser;
use colored::Colorize;
use miette::{miette, Result};
use std::path::PathBuf;

use sptscript::errors::InterpretResult;
use sptscript::{intrinsics, serializer, Vm, VmConfig};

#[derive(ClapParser)]
#[command(
    name = "sptscript",
    version,
    about = "SPT Script virtual machine",
    long_about = "sptscript — run SPT scripts (.flx) and compiled chunks (.flxc)."
)]
struct Cli {
    /// Script or compiled chunk to execute
    path: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let bytes = std::fs::read(&cli.path)
        .map_err(|e| miette!("Cannot read '{}': {}", cli.path.display(), e))?;

    let mut config = VmConfig::default();
    if let Some(parent) = cli.path.parent() {
        config.module_paths.push(parent.to_string_lossy().into_owned());
    }

    let mut vm = Vm::new(config);
    intrinsics::install_core(&mut vm);
    vm.set_error_handler(Box::new(|msg, line| {
        let prefix = "[Runtime Error]".red().bold();
        eprintln!("{} line {}: {}", prefix, line, msg);
    }));

    let chunk = if serializer::looks_like_chunk(&bytes) {
        serializer::deserialize(&bytes)
            .map_err(|e| miette!("Cannot load '{}': {}", cli.path.display(), e))?
    } else {
        // Source input needs the front-end collaborator, which this core
        // build does not link. Compiled chunks run natively.
        let prefix = "[Parse Error]".red().bold();
        eprintln!(
            "{} '{}': no front-end is linked into this build; run a compiled .flxc chunk",
            prefix,
            cli.path.display()
        );
        return Err(miette!("cannot parse source input"));
    };

    match vm.interpret(&chunk) {
        InterpretResult::Ok => Ok(()),
        InterpretResult::CompileError => Err(miette!("compilation failed")),
        InterpretResult::RuntimeError => Err(miette!("runtime error")),
    }
}
