use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;

use evidence_toolkit::hashing::{self, VerificationStatus};
use evidence_toolkit::walker::{readable_size, FileRecord};
use evidence_toolkit::{logging, DirectoryEntry, EvidenceSession, ToolkitConfig, WalkFilter};

#[derive(Parser)]
#[command(name = "evidence-toolkit", version, about = "Read-only access to forensic disk images")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Trace-level logging with source locations
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Container format, size, segments and stored digests
    Info { image: PathBuf },
    /// MD5, SHA-1 and SHA-256 of the whole image, checked against stored digests
    Hash { image: PathBuf },
    /// Volume layout with the filesystem type of every entry
    Volumes { image: PathBuf },
    /// One directory listing
    Ls {
        image: PathBuf,
        /// Filesystem start sector
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Directory inode (root when omitted)
        #[arg(long)]
        inode: Option<u64>,
    },
    /// Recursive file search
    Find {
        image: PathBuf,
        /// Comma-separated extensions; an empty item matches extensionless files
        #[arg(long, value_delimiter = ',', conflicts_with = "query")]
        ext: Option<Vec<String>>,
        /// Name substring, or `.ext` for an exact extension
        #[arg(long)]
        query: Option<String>,
        /// Only search the filesystem at this sector
        #[arg(long)]
        offset: Option<u64>,
    },
    /// File content
    Cat {
        image: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        inode: u64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Raw bytes of a sector range
    Unalloc {
        image: PathBuf,
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Members of a ZIP archive stored in a filesystem
    ZipLs {
        image: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Inode of the archive file
        #[arg(long)]
        inode: u64,
        /// Directory inside the archive
        #[arg(long)]
        path: Option<String>,
    },
    /// One member of a ZIP archive stored in a filesystem
    ZipCat {
        image: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        inode: u64,
        #[arg(long)]
        member: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Windows version of every NTFS partition
    OsInfo { image: PathBuf },
    /// Copy a directory tree (or one file) out of the image
    Export {
        image: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Directory or file inode (root when omitted)
        #[arg(long)]
        inode: Option<u64>,
        #[arg(long)]
        dest: PathBuf,
    },
}

#[derive(Serialize)]
struct VolumeRow {
    address: usize,
    description: String,
    start_sector: u64,
    end_sector: u64,
    size: String,
    fs_type: String,
}

fn main() {
    let cli = Cli::parse();
    if cli.verbose {
        logging::init_verbose();
    } else {
        logging::init();
    }

    if let Err(error) = run(cli) {
        eprintln!("error: {}", error);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<ToolkitConfig, String> {
    match path {
        Some(path) => ToolkitConfig::load(path),
        None => Ok(ToolkitConfig::load_default()),
    }
}

fn open(image: &Path, config: &ToolkitConfig) -> Result<EvidenceSession, String> {
    EvidenceSession::open(image, config.clone()).map_err(|e| e.to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| format!("Failed to serialize output: {}", e))?;
    println!("{}", text);
    Ok(())
}

/// Bytes to a file, or raw to stdout
fn emit_bytes(data: &[u8], out: Option<&Path>) -> Result<(), String> {
    match out {
        Some(path) => {
            std::fs::write(path, data).map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
            eprintln!("{} written to {}", readable_size(data.len() as u64), path.display());
            Ok(())
        }
        None => std::io::stdout()
            .lock()
            .write_all(data)
            .map_err(|e| format!("Failed to write to stdout: {}", e)),
    }
}

fn print_entries(entries: &[DirectoryEntry], json: bool) -> Result<(), String> {
    if json {
        return print_json(&entries);
    }
    for entry in entries {
        let inode = entry.inode.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string());
        let kind = if entry.is_directory { "d" } else { "-" };
        println!(
            "{} {:>10} {:>12}  {}  {}",
            kind,
            inode,
            readable_size(entry.size),
            entry.modified,
            entry.name
        );
    }
    Ok(())
}

fn print_records(records: &[FileRecord], json: bool) -> Result<(), String> {
    if json {
        return print_json(&records);
    }
    for record in records {
        println!(
            "{:>10} {:>10} {:>12}  {}",
            record.fs_offset,
            record.inode.map(|i| i.to_string()).unwrap_or_default(),
            readable_size(record.size),
            record.path
        );
    }
    eprintln!("{} files", records.len());
    Ok(())
}

fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Command::Info { image } => {
            let session = open(&image, &config)?;
            let info = session.info().ok_or("Image container is unavailable")?;
            if json {
                return print_json(&info);
            }
            println!("Path:     {}", info.path);
            println!("Format:   {}", info.format.name());
            println!("Size:     {} ({} bytes)", readable_size(info.size_bytes), info.size_bytes);
            println!("Segments: {}", info.segment_files.len());
            for segment in &info.segment_files {
                println!("  {}", segment);
            }
            for stored in &info.stored_hashes {
                println!("Stored {}: {}", stored.algorithm, stored.hash);
            }
            Ok(())
        }

        Command::Hash { image } => {
            let session = open(&image, &config)?;
            let mut container = session.image().lock().map_err(|_| "Image lock poisoned".to_string())?;
            let digests = hashing::compute_with_progress(&mut container, config.read_buffer_size, |_, _| {})
                .map_err(|e| e.to_string())?;
            if json {
                return print_json(&serde_json::json!({
                    "digests": digests,
                    "verification": digests.verification(),
                }));
            }
            println!("MD5:    {}", digests.md5);
            println!("SHA1:   {}", digests.sha1);
            println!("SHA256: {}", digests.sha256);
            for check in digests.verification() {
                let status = match check.status {
                    VerificationStatus::Verified => "verified",
                    VerificationStatus::Mismatch => "MISMATCH",
                    VerificationStatus::NoReference => "no stored digest",
                };
                println!("{} {}", check.algorithm, status);
            }
            Ok(())
        }

        Command::Volumes { image } => {
            let mut session = open(&image, &config)?;
            let catalog = session.catalog().clone();
            let mut rows = Vec::with_capacity(catalog.volumes.len());
            for volume in &catalog.volumes {
                let fs_type = if volume.is_allocated() {
                    session.fs_type(volume.start_sector).to_string()
                } else {
                    String::new()
                };
                rows.push(VolumeRow {
                    address: volume.address,
                    description: volume.description.clone(),
                    start_sector: volume.start_sector,
                    end_sector: volume.end_sector(),
                    size: readable_size(volume.size_bytes()),
                    fs_type,
                });
            }
            if json {
                return print_json(&serde_json::json!({
                    "layout": catalog.layout,
                    "bare_fs_type": catalog.bare_fs_type,
                    "volumes": rows,
                }));
            }
            println!("Layout: {:?}", catalog.layout);
            if let Some(fs_type) = catalog.bare_fs_type {
                println!("Filesystem at sector 0: {}", fs_type);
            }
            for row in rows {
                println!(
                    "{:>3} {:>12} {:>12} {:>12}  {:<8} {}",
                    row.address, row.start_sector, row.end_sector, row.size, row.fs_type, row.description
                );
            }
            Ok(())
        }

        Command::Ls { image, offset, inode } => {
            let mut session = open(&image, &config)?;
            let entries = session.list(offset, inode);
            print_entries(&entries, json)
        }

        Command::Find { image, ext, query, offset } => {
            let mut session = open(&image, &config)?;
            let filter = match (&ext, &query) {
                (Some(exts), _) => WalkFilter::extensions(exts.as_slice()),
                (None, Some(q)) => WalkFilter::query(q),
                (None, None) => WalkFilter::AllFiles,
            };
            let records: Vec<FileRecord> = match offset {
                Some(fs_offset) => session
                    .walk(fs_offset, "/", filter)
                    .map(|(entry, path)| FileRecord::new(entry, path, fs_offset))
                    .collect(),
                None => match (ext, query) {
                    (Some(exts), _) => session.list_files(Some(exts.as_slice())),
                    (None, Some(q)) => session.search_files(&q),
                    (None, None) => session.list_files::<String>(None),
                },
            };
            print_records(&records, json)
        }

        Command::Cat { image, offset, inode, out } => {
            let mut session = open(&image, &config)?;
            let (data, _) = session
                .read_file(offset, inode)
                .ok_or_else(|| format!("Inode {} is empty or unreadable", inode))?;
            emit_bytes(&data, out.as_deref())
        }

        Command::Unalloc { image, start, end, out } => {
            let mut session = open(&image, &config)?;
            let data = session
                .read_unallocated(start, end)
                .ok_or_else(|| format!("Sectors {}..{} are outside the image", start, end))?;
            emit_bytes(&data, out.as_deref())
        }

        Command::ZipLs { image, offset, inode, path } => {
            let mut session = open(&image, &config)?;
            let entries = match path {
                Some(dir) => session.list_archive_dir(inode, offset, &dir),
                None => session.list_archive(inode, offset),
            }
            .ok_or_else(|| format!("Inode {} is not a readable ZIP archive", inode))?;
            if json {
                return print_json(&entries);
            }
            for entry in &entries {
                let internal = entry.archive.as_ref().map(|a| a.internal_path.as_str()).unwrap_or_default();
                println!("{:>12}  {}  {}", readable_size(entry.size), entry.modified, internal);
            }
            Ok(())
        }

        Command::ZipCat { image, offset, inode, member, out } => {
            let mut session = open(&image, &config)?;
            let data = session
                .read_archive_member(inode, offset, &member)
                .ok_or_else(|| format!("Member {} could not be extracted", member))?;
            emit_bytes(&data, out.as_deref())
        }

        Command::OsInfo { image } => {
            let mut session = open(&image, &config)?;
            let reports = session.os_information();
            if json {
                return print_json(&reports);
            }
            for report in reports {
                println!("[{}] {} ({})", report.start_sector, report.description, report.fs_type);
                match report.identity {
                    Some(identity) => println!("{}\n", identity),
                    None => println!("No Windows installation found\n"),
                }
            }
            Ok(())
        }

        Command::Export { image, offset, inode, dest } => {
            let mut session = open(&image, &config)?;
            let is_file = inode
                .and_then(|i| session.file_meta(offset, i))
                .is_some_and(|meta| !meta.is_dir());
            match inode {
                Some(file) if is_file => {
                    let written = session.export_file(offset, file, &dest)?;
                    if json {
                        return print_json(&serde_json::json!({ "bytes": written }));
                    }
                    println!("{} written to {}", readable_size(written), dest.display());
                }
                _ => {
                    let summary = session.export_directory(offset, inode, &dest)?;
                    if json {
                        return print_json(&summary);
                    }
                    println!(
                        "{} files, {} directories, {} exported, {} skipped",
                        summary.files,
                        summary.directories,
                        readable_size(summary.bytes),
                        summary.skipped
                    );
                }
            }
            Ok(())
        }
    }
}
