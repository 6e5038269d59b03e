use anvil::cxx::CxxModule;
use anvil::cxx::toolchain::{CxxOptions, lld_available};
use anvil::delta::FileDeltaChecker;
use anvil::errors::{BuildError, SharedError};
use anvil::goals::GoalTracker;
use anvil::locks::FileLocks;
use anvil::path::AbsPath;
use anvil::persist::Persistence;
use anvil::progress::Progress;
use anvil::project::BuildProject;
use anvil::runtime::AsyncRuntime;
use anvil::workspace::Workspace;
use anyhow::Result;
use clap::Parser;
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "anvil", version, about = "Incremental content-addressed build orchestrator")]
struct Cli {
    /// Project manifest, or a directory containing project.toml
    project: PathBuf,

    /// Goal names to build (typically executable names such as main.exe)
    goals: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    /// Run at most one subprocess at a time
    #[arg(long)]
    sequential: bool,

    /// Bound the number of concurrent subprocesses
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Emit textual intermediate representation instead of object code
    #[arg(long)]
    disassembly: bool,

    /// Compile debug information
    #[arg(long)]
    debug: bool,

    /// Enable optimizations
    #[arg(long)]
    optimize: bool,

    /// Compiler executable
    #[arg(long, default_value = "clang++")]
    compiler: String,

    /// Skip the separate preprocess step
    #[arg(long)]
    no_preprocess: bool,

    /// Never use the LLVM pipeline, even when lld is available
    #[arg(long)]
    no_lld: bool,

    /// Intermediate output root
    #[arg(long, default_value = "obj")]
    obj_dir: PathBuf,

    /// Executable output root
    #[arg(long, default_value = "bin")]
    bin_dir: PathBuf,

    /// Journal location (default: <obj-dir>/anvil.json)
    #[arg(long)]
    state_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if is_interrupt(&err) {
                eprintln!("Interrupted");
            } else {
                eprintln!("{} {err:#}", style("error:").red().bold());
            }
            ExitCode::FAILURE
        }
    }
}

fn is_interrupt(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<BuildError>()
            .is_some_and(BuildError::is_interrupt)
            || cause
                .downcast_ref::<SharedError>()
                .is_some_and(SharedError::is_interrupt)
    })
}

fn run(cli: &Cli) -> Result<()> {
    let obj_dir = AbsPath::new(&cli.obj_dir);
    let options = CxxOptions {
        root: AbsPath::new("."),
        obj_dir: obj_dir.resolve("cxx"),
        src_dir: obj_dir.resolve("cpp"),
        bin_dir: AbsPath::new(&cli.bin_dir),
        compiler: cli.compiler.clone(),
        assemble: cli.disassembly,
        debug: cli.debug,
        optimize: cli.optimize,
        preprocess: !cli.no_preprocess,
        use_lld: !cli.no_lld && lld_available(),
    };
    let state_file = cli
        .state_file
        .as_ref()
        .map(AbsPath::new)
        .unwrap_or_else(|| obj_dir.resolve("anvil.json"));

    let mut ws = Workspace::new();
    ws.add_instance(Progress::new(cli.verbose))?;
    let persistence = ws.add::<Persistence>()?;
    persistence.set_file(state_file)?;

    let runtime = if cli.sequential {
        AsyncRuntime::sequential()
    } else if let Some(jobs) = cli.jobs {
        AsyncRuntime::with_jobs(jobs)
    } else {
        AsyncRuntime::default()
    };
    ws.add_instance(runtime)?;

    ws.add::<FileDeltaChecker>()?;
    ws.add::<FileLocks>()?;
    let goals = ws.add::<GoalTracker>()?;
    ws.seed(CxxModule::new(options))?;

    let project = BuildProject::load(&AbsPath::new(&cli.project))?;
    ws.add_instance(project)?;

    for goal in &cli.goals {
        goals.activate(goal);
    }
    ws.run()
}
