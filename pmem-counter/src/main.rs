use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pmem_region::{maps, BindError, LayoutError, MapError, Mapper, Store};
use tracing_subscriber::EnvFilter;

mod counter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let CounterCommand { command } = CounterCommand::parse();

    let result = match command {
        Command::Run { file, maps } => run(&file, maps),
        Command::Inspect { file } => inspect(&file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Parser)]
#[command(version, about = "Count invocations in a memory region backed by a file")]
struct CounterCommand {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bind the region to the backing file, print both counters and increment them.
    Run {
        /// The backing file. Created if missing, always resized to the region.
        #[arg(long, env = "PMEM_FILE", default_value = "mmap.persistent")]
        file: PathBuf,

        /// Print the memory map of this process after binding.
        #[arg(long)]
        maps: bool,
    },
    /// Print the persisted fields of a backing file without binding it.
    Inspect {
        #[arg(help = "The backing file")]
        file: PathBuf,
    },
}

enum Error {
    Layout(LayoutError),
    Reserve(MapError),
    Bind { path: PathBuf, err: BindError },
    Flush(MapError),
    Maps(std::io::Error),
    Read { path: PathBuf, err: std::io::Error },
}

fn run(path: &Path, show_maps: bool) -> Result<(), Error> {
    let (layout, fields) = counter::declare().map_err(Error::Layout)?;
    let mut store = Store::new(layout).map_err(Error::Reserve)?;

    tracing::debug!(path = %path.display(), "binding counter region");
    store.bind(path).map_err(|err| Error::Bind {
        path: path.to_owned(),
        err,
    })?;

    println!("{}", store.region().report());

    // Report the value seen at startup, leave the next one for the following run.
    let counter = store.update(&fields.counter, |v| v.wrapping_add(1));
    println!("counter({:#x}) = {counter}", store.address_of(&fields.counter));

    let scratch = store.update(&fields.scratch, |v| v.wrapping_add(1));
    println!("scratch({:#x}) = {scratch}", store.address_of(&fields.scratch));

    if show_maps {
        println!("---- memory map of process {}:", std::process::id());
        for entry in maps::self_maps().map_err(Error::Maps)? {
            let mark = if entry.overlaps(store.region()) { '*' } else { ' ' };
            println!("{mark} {entry}");
        }
    }

    store.flush().map_err(Error::Flush)
}

fn inspect(path: &Path) -> Result<(), Error> {
    let read_err = |err| Error::Read {
        path: path.to_owned(),
        err,
    };

    let (layout, fields) = counter::declare().map_err(Error::Layout)?;
    let file = std::fs::File::open(path).map_err(read_err)?;
    let len = file.metadata().map_err(read_err)?.len();

    // Nothing to map in an empty file.
    let map = if len > 0 {
        // Safety: we only read and the file is not expected to change while we do.
        Some(unsafe { memmap2::Mmap::map(&file) }.map_err(read_err)?)
    } else {
        None
    };

    let bytes: &[u8] = map.as_deref().unwrap_or(&[]);
    let page_size = Mapper::new().page_size();
    if layout.region_len(page_size) != Some(bytes.len()) {
        tracing::warn!(len = bytes.len(), "file size differs from the region of this build");
    }

    println!("{}: {} bytes", path.display(), bytes.len());

    for declared in layout.declared().iter().filter(|d| d.persistent) {
        println!("  {} at offset {:#x}, {} bytes", declared.name, declared.offset, declared.len);
    }

    match fields.counter.read_from(bytes) {
        Some(value) => println!("counter = {value}"),
        None => println!("counter = <missing>"),
    }

    Ok(())
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Layout(err) => write!(f, "invalid layout: {err}"),
            Error::Reserve(err) => write!(f, "failed to reserve the region: {err}"),
            Error::Bind { path, err } => match err {
                BindError::OpenFailed(inner) | BindError::ResizeFailed(inner) => {
                    write!(f, "failed to {} backing file {}: {inner}", err.step(), path.display())
                }
                BindError::MapFailed(inner) => {
                    write!(f, "failed to map backing file {}: {inner}", path.display())
                }
                BindError::AlreadyBound => write!(f, "{}: {err}", path.display()),
            },
            Error::Flush(err) => write!(f, "failed to flush the region: {err}"),
            Error::Maps(err) => write!(f, "failed to read the process memory map: {err}"),
            Error::Read { path, err } => write!(f, "failed to read {}: {err}", path.display()),
        }
    }
}
