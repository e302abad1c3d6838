use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use egg_core::{ArchiveBuilder, BuildEvent, BuildOptions, CompressionPolicy, EggReader};
use indicatif::{ProgressBar, ProgressStyle};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{info, Level};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(version, about = "Build, list and extract EGG archives")]
struct Args {
    /// Set the logging level
    #[arg(short, long, value_enum, default_value = "warn", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pack files and directories into an .egg archive
    Build {
        #[arg(short, long)]
        output: PathBuf,
        /// Files or directories to add
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Store every file uncompressed
        #[arg(long)]
        no_compress: bool,
        /// Build timestamp to record instead of the current time
        #[arg(long)]
        timestamp: Option<u64>,
    },
    /// Extract one file out of an .egg archive
    Extract {
        archive: PathBuf,
        /// Name inside the archive (case-insensitive)
        file: String,
        /// Directory to write into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// List all files inside an archive
    Ls { archive: PathBuf },
    /// Inspect archive metadata
    Inspect { archive: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::from(args.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match args.cmd {
        Commands::Build {
            output,
            inputs,
            no_compress,
            timestamp,
        } => {
            let compression = if no_compress {
                CompressionPolicy::disabled()
            } else {
                CompressionPolicy::default()
            };
            build_archive(&inputs, &output, BuildOptions { timestamp, compression })
        }
        Commands::Extract {
            archive,
            file,
            output,
        } => extract_file(&archive, &file, &output),
        Commands::Ls { archive } => list_archive(&archive),
        Commands::Inspect { archive } => inspect_archive(&archive),
    }
}

/// Expand directories into their files. Names are relative to the directory;
/// plain files keep the path they were given as.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() {
                    let relative = entry.path().strip_prefix(input)?.to_string_lossy().to_string();
                    files.push((relative.replace('\\', "/"), entry.into_path()));
                }
            }
        } else {
            files.push((input.to_string_lossy().replace('\\', "/"), input.clone()));
        }
    }
    Ok(files)
}

fn build_archive(inputs: &[PathBuf], output: &Path, options: BuildOptions) -> Result<()> {
    let files = collect_inputs(inputs)?;
    if files.is_empty() {
        bail!("The egg needs at least one file");
    }

    let mut builder = ArchiveBuilder::with_options(options);
    for (name, path) in &files {
        builder.add_file(name.as_str(), path.as_path());
    }

    let bar = ProgressBar::new(files.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let summary = builder
        .write_to_path(output, |event: &BuildEvent| {
            bar.set_message(event.name.clone());
            bar.println(describe(event, output));
            bar.inc(1);
        })
        .with_context(|| format!("Failed to build {}", output.display()))?;
    bar.finish_and_clear();

    info!(
        files = summary.file_count,
        size = summary.archive_size,
        "archive written"
    );
    println!(
        "Wrote {} files ({} bytes) to {}",
        summary.file_count,
        summary.archive_size,
        output.display()
    );
    Ok(())
}

fn describe(event: &BuildEvent, output: &Path) -> String {
    if event.compressed {
        format!(
            "Added {} ({} bytes compressed to {}) to {}",
            event.name,
            event.original_size,
            event.stored_size,
            output.display()
        )
    } else {
        format!(
            "Added {} ({} bytes) to {}",
            event.name,
            event.original_size,
            output.display()
        )
    }
}

fn extract_file(archive: &Path, name: &str, output_dir: &Path) -> Result<()> {
    let reader = EggReader::open(archive)
        .with_context(|| format!("Unable to open {}", archive.display()))?;
    let index = reader.index()?;
    let entry = index
        .entry_by_name(name)
        .with_context(|| format!("Unable to find {name} within {}", archive.display()))?;

    let file_name = output_file_name(&entry.name)
        .with_context(|| format!("{:?} does not name a file to extract", entry.name))?;
    let target = output_dir.join(file_name);
    let file = File::create(&target)
        .with_context(|| format!("Unable to open {} for writing", target.display()))?;
    let mut writer = BufWriter::new(file);

    let written = index
        .extract(entry, &mut writer)
        .and_then(|n| writer.flush().map(|_| n).map_err(Into::into));
    match written {
        Ok(n) => {
            println!("Extracted {} ({n} bytes) to {}", entry.name, target.display());
            Ok(())
        }
        Err(e) => {
            drop(writer);
            fs::remove_file(&target).ok();
            Err(e).with_context(|| format!("Failed to extract {}", entry.name))
        }
    }
}

/// Last path component of an archive name, split on either separator.
/// `.`, `..`, drive prefixes and empty names give `None`.
fn output_file_name(name: &str) -> Option<&OsStr> {
    let last = name.rsplit(['/', '\\']).next()?;
    let mut components = Path::new(last).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(file_name)), None) => Some(file_name),
        _ => None,
    }
}

fn list_archive(archive: &Path) -> Result<()> {
    let reader = EggReader::open(archive)
        .with_context(|| format!("Unable to open {}", archive.display()))?;
    let index = reader.index()?;

    println!(
        "{:<50} | {:<24} | {:<11} | {:>10} | {:>10}",
        "NAME", "TYPE", "COMPRESSION", "STORED", "SIZE"
    );
    println!("{:-<50}-|-{:-<24}-|-{:-<11}-|-{:->10}-|-{:->10}", "", "", "", "", "");

    for entry in index.entries() {
        let mime = mime_guess::from_path(&entry.name).first_or_octet_stream();
        println!(
            "{:<50} | {:<24} | {:<11} | {:>10} | {:>10}",
            entry.name,
            mime.as_ref(),
            entry.compression_label(),
            entry.compressed_size,
            entry.uncompressed_size
        );
    }
    Ok(())
}

fn inspect_archive(archive: &Path) -> Result<()> {
    let reader = EggReader::open(archive)
        .with_context(|| format!("Unable to open {}", archive.display()))?;
    let index = reader.index()?;
    let header = index.header();

    let stored: u64 = index.entries().iter().map(|e| u64::from(e.compressed_size)).sum();
    let original: u64 = index.entries().iter().map(|e| u64::from(e.uncompressed_size)).sum();
    let compressed = index.entries().iter().filter(|e| e.compressed).count();

    println!("Archive:        {}", reader.path().display());
    println!("Size:           {} bytes", reader.bytes().len());
    println!("Version:        {}", header.version.get());
    println!("Flags:          {:#06x}", header.flags.get());
    println!("Timestamp:      {}", header.timestamp.get());
    println!("Files:          {} ({compressed} compressed)", index.len());
    println!("TOC offset:     {}", header.toc_offset.get());
    println!("Names offset:   {}", header.filename_offset.get());
    println!("Content:        {stored} bytes stored, {original} bytes original");
    println!("Status: VALID EGG Archive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_expand_to_relative_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let files = collect_inputs(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn build_then_extract() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir(&input).unwrap();
        fs::write(input.join("Notes.txt"), b"egg notes").unwrap();

        let archive = dir.path().join("out.egg");
        build_archive(&[input], &archive, BuildOptions::default()).unwrap();

        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        extract_file(&archive, "notes.TXT", &out).unwrap();
        assert_eq!(fs::read(out.join("Notes.txt")).unwrap(), b"egg notes");

        assert!(extract_file(&archive, "missing", &out).is_err());
        list_archive(&archive).unwrap();
        inspect_archive(&archive).unwrap();
    }

    #[test]
    fn extracted_names_stay_inside_the_output_directory() {
        assert_eq!(output_file_name("dir/a.txt"), Some(OsStr::new("a.txt")));
        assert_eq!(output_file_name("..\\..\\x"), Some(OsStr::new("x")));
        assert_eq!(output_file_name("plain"), Some(OsStr::new("plain")));
        for name in ["", "..", ".", "a/", "up/.."] {
            assert_eq!(output_file_name(name), None, "{name:?}");
        }
    }

    #[test]
    fn describe_mentions_compression() {
        let event = BuildEvent {
            index: 0,
            name: "big.bin".to_string(),
            original_size: 20_000,
            stored_size: 90,
            compressed: true,
        };
        assert_eq!(
            describe(&event, Path::new("out.egg")),
            "Added big.bin (20000 bytes compressed to 90) to out.egg"
        );
    }
}
