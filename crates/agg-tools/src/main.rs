use agg::{Archive, DirectoryEntry, ExtractOptions};
use anyhow::{bail, Context, Result};
use clap::{arg, value_parser, Arg, ArgAction, ArgMatches, Command};
use colorize::AnsiColor;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::{
    fs::File,
    io::{stdout, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("agg-tools")
        .about("Tools for reading and unpacking AGG archives")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::Count)
                .help("Log more, repeat for trace output"),
        )
        .subcommand(
            Command::new("unpack")
                .about("Extract every file in an AGG")
                .arg(arg!(archive_path: <ARCHIVE>))
                .arg(arg!(-o --out [OUT] "Destination directory, defaults to the archive name"))
                .arg(
                    arg!(-t --threads [THREADS] "Extraction workers, 0 for one per core")
                        .env("AGG_THREADS")
                        .value_parser(value_parser!(usize)),
                )
                .arg(arg!(--verify "Reject entries whose CRC-32 differs from the stored one")),
        )
        .subcommand(
            Command::new("list")
                .about("List files in an AGG")
                .arg(arg!(archive_path: <ARCHIVE>))
                .arg(arg!(-j - -json))
                .arg(arg!(-p - -pretty)),
        )
        .subcommand(
            Command::new("info")
                .about("Get info about a file in an AGG")
                .arg(arg!(archive_path: <ARCHIVE>))
                .arg(arg!(file: <FILE>))
                .arg(arg!(-j - -json))
                .arg(arg!(-p - -pretty)),
        )
        .subcommand(
            Command::new("read")
                .about("Read a file in an AGG")
                .arg(arg!(archive_path: <ARCHIVE>))
                .arg(arg!(file: <FILE>))
                .arg(arg!(-s --start [START]).value_parser(value_parser!(u64)))
                .arg(arg!(-e --end [END]).value_parser(value_parser!(u64))),
        )
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    let verbose = matches
        .subcommand()
        .map(|(_, sub_matches)| sub_matches.get_count("verbose"))
        .unwrap_or(0)
        .max(matches.get_count("verbose"));
    init_tracing(verbose);
    match run(&matches) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", AnsiColor::red(format!("error: {e:#}")));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(matches: &ArgMatches) -> Result<ExitCode> {
    match matches.subcommand() {
        Some(("unpack", sub_matches)) => unpack(sub_matches),
        Some(("list", sub_matches)) => {
            let (archive, _) = open_archive(sub_matches)?;
            let directory = archive.directory();
            if sub_matches.get_flag("json") {
                print_json(directory, sub_matches.get_flag("pretty"))?;
            } else {
                for entry in directory {
                    if sub_matches.get_flag("pretty") {
                        println!(
                            "{:<15} {:>10} {} {}",
                            entry.name,
                            entry.size,
                            format!("@{}", entry.offset).blue(),
                            format!("{:08x}", entry.crc).yellow()
                        );
                    } else {
                        println!("{}", entry.name);
                    }
                }
                if directory.shadowed() > 0 {
                    println!(
                        "{}",
                        AnsiColor::redb(format!(
                            "Shadowed entries: {}",
                            directory.shadowed()
                        ))
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(("info", sub_matches)) => {
            let (archive, _) = open_archive(sub_matches)?;
            let name = required(sub_matches, "file")?;
            let Some(entry) = archive.directory().get(name) else {
                bail!("{name} not found in the archive");
            };
            let info = EntryInfo::from(entry);
            if sub_matches.get_flag("json") {
                print_json(&info, sub_matches.get_flag("pretty"))?;
            } else {
                serde_yaml::to_writer(stdout().lock(), &info).context("Couldn't encode info")?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(("read", sub_matches)) => {
            let (archive, _) = open_archive(sub_matches)?;
            let name = required(sub_matches, "file")?;
            let Some(mut entry) = archive.entry(name) else {
                bail!("{name} not found in the archive");
            };
            let start = sub_matches.get_one::<u64>("start").copied();
            let end = sub_matches.get_one::<u64>("end").copied();
            copy_range(&mut entry, start, end, &mut stdout().lock())?;
            Ok(ExitCode::SUCCESS)
        }
        _ => unreachable!(),
    }
}

fn unpack(sub_matches: &ArgMatches) -> Result<ExitCode> {
    let (archive, arc_path) = open_archive(sub_matches)?;
    println!("Found file: {}", arc_path.display());
    println!("Size of archive (in bytes): {}", archive.size());
    println!("Total items: {}", archive.directory().item_count);

    let out = match sub_matches.get_one::<String>("out") {
        Some(path) => PathBuf::from(path),
        None => default_output_dir(&arc_path),
    };
    std::fs::create_dir_all(&out)
        .with_context(|| format!("Couldn't create directory {}", out.display()))?;
    println!("Output directory: {}", out.display());

    let options = ExtractOptions::default()
        .threads(sub_matches.get_one::<usize>("threads").copied().unwrap_or(0))
        .verify_checksums(sub_matches.get_flag("verify"));

    let progress = ProgressBar::new(archive.directory().total_size()).with_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{eta}] {wide_bar} {bytes}/{total_bytes} ({percent_precise}%)",
        )
        .context("Invalid progress template")?,
    );
    let sizes = archive.directory();
    let report = archive.extract_all_with(&out, &options, |outcome| {
        if let Some(entry) = sizes.get(&outcome.name) {
            progress.inc(entry.size as u64);
        }
        match &outcome.result {
            Ok(_) => progress.println(format!("extract: {}", outcome.name)),
            Err(e) => progress.println(AnsiColor::red(format!(
                "failed: {} ({e})",
                outcome.name
            ))),
        }
    });
    progress.finish_and_clear();

    println!("Total extracted: {}", report.extracted().count());
    let failed = report.failures().count();
    if failed > 0 {
        println!("{}", AnsiColor::redb(format!("Failed: {failed}")));
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Copies `start..end` of an entry, clamping `end` to the entry length.
fn copy_range<R: Read + Seek, W: Write>(
    entry: &mut R,
    start: Option<u64>,
    end: Option<u64>,
    out: &mut W,
) -> Result<u64> {
    let len = entry
        .seek(SeekFrom::End(0))
        .context("Couldn't seek to end of file")?;
    let start = start.unwrap_or(0);
    let end = end.unwrap_or(len).min(len);
    if start > end {
        bail!("start {start} is past end {end}");
    }
    entry
        .seek(SeekFrom::Start(start))
        .context("Couldn't seek to start of file")?;
    std::io::copy(&mut entry.take(end - start), out).context("Couldn't copy into stdout")
}

/// Archive path with its extension removed: `data/heroes2.agg` -> `data/heroes2`.
fn default_output_dir(arc_path: &Path) -> PathBuf {
    let out = arc_path.with_extension("");
    if out == arc_path {
        let mut name = out.into_os_string();
        name.push(".d");
        return PathBuf::from(name);
    }
    out
}

fn open_archive(sub_matches: &ArgMatches) -> Result<(Archive<File>, PathBuf)> {
    let arc_path = PathBuf::from(required(sub_matches, "archive_path")?);
    let arc_file = File::open(&arc_path)
        .with_context(|| format!("Couldn't open {}", arc_path.display()))?;
    let archive = Archive::open(arc_file)
        .with_context(|| format!("Couldn't read {} as an AGG archive", arc_path.display()))?;
    debug!(
        path = %arc_path.display(),
        len = archive.size(),
        entries = archive.directory().len(),
        "opened archive"
    );
    Ok((archive, arc_path))
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .with_context(|| format!("Missing argument {id}"))
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    if pretty {
        serde_json::to_writer_pretty(stdout().lock(), value)
    } else {
        serde_json::to_writer(stdout().lock(), value)
    }
    .context("Couldn't encode json")?;
    println!();
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct EntryInfo {
    name: String,
    index: u32,
    offset: u32,
    size: u32,
    crc: String,
}

impl From<&DirectoryEntry> for EntryInfo {
    fn from(entry: &DirectoryEntry) -> Self {
        Self {
            name: entry.name.clone(),
            index: entry.index,
            offset: entry.offset,
            size: entry.size,
            crc: format!("{:08x}", entry.crc),
        }
    }
}
