use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use statescript::bytecode::disasm;
use statescript::compiler::compile_source;
use statescript::diagnostic::Diagnostic;
use statescript::host::{EventArgs, HostRegistry, World};
use statescript::script::ScriptDefinition;
use statescript::value::Value;

#[derive(Parser, Debug)]
#[command(name = "statescript")]
#[command(about = "Compile, inspect and run entity state-machine scripts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a script and report diagnostics
    Check {
        /// Script source file
        file: PathBuf,
    },
    /// Print the compiled bytecode listing
    Dump {
        /// Script source file
        file: PathBuf,

        /// Emit the listing as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Compile a script, bind it to one object and update it for a while
    Run {
        /// Script source file
        file: PathBuf,

        /// Number of update frames to simulate
        #[arg(long, default_value = "60")]
        frames: u32,

        /// Seed for the world's random number generator
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Check { file } => check(&file),
        Command::Dump { file, json } => dump(&file, json),
        Command::Run { file, frames, seed } => run(&file, frames, seed),
    }
}

/// Compiles the file against a default world, printing every diagnostic.
/// Exits nonzero when the definition comes back invalid.
fn compile_file(path: &Path, world: &World) -> ScriptDefinition {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: cannot read {}: {e}", path.display());
            process::exit(1);
        }
    };
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("script");
    compile_source(name, &source, world)
}

fn check(path: &Path) {
    let world = World::new();
    let def = compile_file(path, &world);
    if !def.valid {
        for error in &def.errors {
            eprintln!("{}", Diagnostic::from(error));
        }
        process::exit(1);
    }
    if def.states().next().is_none() {
        let warning = Diagnostic::warning("defines no states")
            .with_script(&def.name)
            .with_note("nothing will run on update");
        eprintln!("{warning}");
    }
    println!(
        "{}: ok ({} chunks, {} states)",
        def.name,
        def.chunks.len(),
        def.states().count()
    );
}

fn dump(path: &Path, json: bool) {
    let world = World::new();
    let def = compile_file(path, &world);
    if !def.valid {
        for error in &def.errors {
            eprintln!("{}", Diagnostic::from(error));
        }
        process::exit(1);
    }
    if json {
        match serde_json::to_string_pretty(&disasm::listing(&def)) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("error: cannot serialize listing: {e}");
                process::exit(1);
            }
        }
    } else {
        print!("{}", disasm::disassemble(&def));
    }
}

fn run(path: &Path, frames: u32, seed: Option<u64>) {
    let mut world = match seed {
        Some(seed) => World::with_seed(seed),
        None => World::new(),
    };
    let def = compile_file(path, &world);
    if !def.valid {
        for error in &def.errors {
            eprintln!("{}", Diagnostic::from(error));
        }
        process::exit(1);
    }
    let name = def.name.clone();

    let id = world.spawn_scripted(&name, std::rc::Rc::new(def), &EventArgs::new());
    world.resolve_references();

    let dt = 1.0 / 60.0;
    for frame in 0..frames {
        let mut args = EventArgs::new();
        args.set("dt", Value::Number(dt));
        args.set("frame", Value::Number(frame as f64));
        world.update_entity(id, &mut args);
    }

    let component = world
        .component(id)
        .expect("component vanished mid-run")
        .borrow();
    let state = component.state_name().unwrap_or("-");
    println!("{name}: {frames} frames, final state {state}");
    if !component.is_valid() {
        process::exit(1);
    }
}
