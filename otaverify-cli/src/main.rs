// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

use otaverify_fsverifier as fsverifier;
use otaverify_storage as storage;
use otaverify_utils_async as utils_async;

use anyhow::Context as _;
use base64::Engine as _;
use clap::{self, Parser as _};
use fsverifier::{ErrorCode, FilesystemVerifierAction, FilesystemVerifierDelegate, InstallPlan, hasher};
use pollster::FutureExt as _;
use std::{
    fs,
    path::{Path, PathBuf},
    process,
};
use storage::blkdev::{
    FilePartitionDevice, FilePartitionDevices, PartitionDevices as _, PartitionIo as _, PartitionIoFutureAsCoreFuture,
};
use storage::dynamic_partition::DynamicPartitionControlStub;
use storage::verity::{DmVerityWriter, VerityLayout, VerityWriter as _};
use utils_async::asynchronous::MessageLoop;

fn cli_parse_size(arg: &str) -> Result<u64, clap::error::Error> {
    let invalid = |msg: &str| clap::Error::raw(clap::error::ErrorKind::ValueValidation, msg.to_owned());

    let arg = arg.trim();
    let digits_end = arg.find(|c: char| !c.is_ascii_digit()).unwrap_or(arg.len());
    let unit = match arg[digits_end..].trim() {
        "" | "B" => 1u64,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        _ => return Err(invalid("unrecognized unit, possible values: none|B, K, M, G")),
    };
    let value = arg[..digits_end]
        .parse::<u64>()
        .map_err(|_| invalid("invalid or too large value"))?;
    value.checked_mul(unit).ok_or_else(|| invalid("value too large"))
}

#[derive(Clone, Debug, Default, PartialEq)]
struct CliHexStr(Vec<u8>);

fn cli_parse_hexstr(arg: &str) -> Result<CliHexStr, clap::error::Error> {
    let arg = arg.trim();
    // Pad odd length strings with a zero nibble at the head.
    let padded;
    let arg = if arg.len() % 2 != 0 {
        padded = format!("0{}", arg);
        padded.as_str()
    } else {
        arg
    };
    hex::decode(arg).map(CliHexStr).map_err(|_| {
        clap::Error::raw(
            clap::error::ErrorKind::ValueValidation,
            "invalid digit in hexadecimal string",
        )
    })
}

#[derive(clap::Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Verify the partitions of an install plan.
    ///
    /// The process exits with the numeric result code, zero on success.
    Verify(CliVerifyArgs),

    /// Print the Base64 encoded SHA-256 digest of a partition image.
    Hash(CliHashArgs),

    /// Compute and write dm-verity hash tree and FEC to a partition image.
    WriteVerity(CliWriteVerityArgs),
}

#[derive(clap::Args)]
struct CliVerifyArgs {
    /// Install plan JSON file.
    #[arg(short, long, value_name = "FILE")]
    plan: PathBuf,

    /// Don't write verity metadata, even if the plan asks for it.
    #[arg(long)]
    no_write_verity: bool,
}

#[derive(clap::Args)]
struct CliHashArgs {
    /// Partition image file.
    #[arg(short, long, value_name = "FILE")]
    image: PathBuf,

    /// Hash only that many leading bytes.
    #[arg(short, long, value_parser = cli_parse_size)]
    size: Option<u64>,
}

#[derive(clap::Args)]
struct CliWriteVerityArgs {
    /// Partition image file.
    #[arg(short, long, value_name = "FILE")]
    image: PathBuf,

    #[arg(long, default_value = "4096", value_parser = cli_parse_size)]
    block_size: u64,

    #[arg(long, default_value = "sha256")]
    hash_algorithm: String,

    /// Hash tree salt as a hexadecimal string.
    #[arg(long, default_value = "", value_parser = cli_parse_hexstr)]
    salt: CliHexStr,

    /// Size of the hashed data region at the image's beginning.
    #[arg(long, value_parser = cli_parse_size)]
    data_size: u64,

    #[arg(long, default_value = "0", value_parser = cli_parse_size)]
    hash_tree_offset: u64,

    #[arg(long, default_value = "0", value_parser = cli_parse_size)]
    hash_tree_size: u64,

    /// Location of the FEC. The FEC covers the data and the hash tree.
    #[arg(long, default_value = "0", value_parser = cli_parse_size)]
    fec_offset: u64,

    #[arg(long, default_value = "0", value_parser = cli_parse_size)]
    fec_size: u64,

    #[arg(long, default_value_t = 2)]
    fec_roots: u32,
}

struct StderrProgress;

impl FilesystemVerifierDelegate for StderrProgress {
    fn on_verify_progress_update(&mut self, progress: f64) {
        eprint!("\rverifying: {:5.1}%", progress * 100.);
        if progress >= 1.0 {
            eprintln!();
        }
    }
}

fn verify(args: &CliVerifyArgs) -> anyhow::Result<ErrorCode> {
    let plan = fs::read(&args.plan).with_context(|| format!("failed to read {}", args.plan.display()))?;
    let mut plan: InstallPlan =
        serde_json::from_slice(&plan).with_context(|| format!("failed to parse {}", args.plan.display()))?;
    if args.no_write_verity {
        plan.write_verity = false;
    }

    let mut action = FilesystemVerifierAction::new(
        FilePartitionDevices::new(),
        DynamicPartitionControlStub::<FilePartitionDevice>::new(),
        DmVerityWriter::new(),
    );
    action.set_delegate(Box::new(StderrProgress));

    let message_loop = MessageLoop::new();
    let waiter = MessageLoop::post_task(&message_loop, action.perform_action(Some(plan)));
    if !MessageLoop::run(&message_loop) {
        anyhow::bail!("message loop stuck with no runnable task");
    }
    let result = waiter.take().context("verification task did not complete")?;
    if let Err(e) = &result {
        eprintln!("error: {}", e);
    }
    Ok(ErrorCode::from_result(&result))
}

fn open_image(path: &Path, writable: bool) -> anyhow::Result<FilePartitionDevice> {
    let path = path.to_str().context("image path is not valid UTF-8")?;
    FilePartitionDevices::new()
        .open(path, writable)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path, e))
}

fn hash(args: &CliHashArgs) -> anyhow::Result<()> {
    let dev = open_image(&args.image, false)?;
    let size = match args.size {
        Some(size) => size,
        None => dev.size().context("unable to determine image size")?,
    };

    let hash_fut = hasher::HashPartitionFuture::<FilePartitionDevice, DmVerityWriter>::new(size, size, None)
        .map_err(|(_, e)| anyhow::anyhow!("failed to set up hashing: {}", e))?;
    let (_, digest) = PartitionIoFutureAsCoreFuture::new(&dev, hash_fut).block_on();
    let digest = digest.context("failed to hash image")?;
    println!("{}", base64::engine::general_purpose::STANDARD.encode(digest));
    Ok(())
}

/// Assemble the [`VerityLayout`] from the command line arguments.
///
/// Returns the layout together with the end of the verity metadata.
fn cli_verity_layout(args: &CliWriteVerityArgs) -> anyhow::Result<(VerityLayout, u64)> {
    let block_size = u32::try_from(args.block_size).context("block size too large")?;
    let hash_tree_end = args
        .hash_tree_offset
        .checked_add(args.hash_tree_size)
        .context("hash tree end out of range")?;
    let fec_end = args
        .fec_offset
        .checked_add(args.fec_size)
        .context("FEC end out of range")?;

    let layout = VerityLayout {
        block_size,
        hash_tree_algorithm: args.hash_algorithm.clone(),
        hash_tree_salt: args.salt.0.clone(),
        hash_tree_data_offset: 0,
        hash_tree_data_size: args.data_size,
        hash_tree_offset: args.hash_tree_offset,
        hash_tree_size: args.hash_tree_size,
        fec_data_offset: 0,
        fec_data_size: match (args.fec_size, args.hash_tree_size) {
            (0, _) => 0,
            (_, 0) => args.data_size,
            _ => hash_tree_end,
        },
        fec_offset: args.fec_offset,
        fec_size: args.fec_size,
        fec_roots: args.fec_roots,
    };
    Ok((layout, hash_tree_end.max(fec_end)))
}

fn write_verity(args: &CliWriteVerityArgs) -> anyhow::Result<()> {
    let (layout, metadata_end) = cli_verity_layout(args)?;

    let dev = open_image(&args.image, true)?;
    let image_size = dev.size().context("unable to determine image size")?;
    if metadata_end > image_size {
        anyhow::bail!("verity metadata end {} beyond image size {}", metadata_end, image_size);
    }

    let mut verity_writer = DmVerityWriter::new();
    verity_writer.init(&layout).context("invalid verity layout")?;
    let hash_fut =
        hasher::HashPartitionFuture::<FilePartitionDevice, _>::new(image_size, args.data_size, Some(verity_writer))
            .map_err(|(_, e)| anyhow::anyhow!("failed to set up hashing: {}", e))?;
    let (verity_writer, digest) = PartitionIoFutureAsCoreFuture::new(&dev, hash_fut).block_on();
    let digest = digest.context("failed to write verity metadata")?;

    if let Some(root_digest) = verity_writer.as_ref().and_then(|w| w.last_root_digest()) {
        println!("root digest: {}", hex::encode(root_digest));
    }
    println!("image digest: {}", base64::engine::general_purpose::STANDARD.encode(digest));
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        CliCommand::Verify(args) => verify(args).map(|code| code.as_u32() as i32),
        CliCommand::Hash(args) => hash(args).map(|_| 0),
        CliCommand::WriteVerity(args) => write_verity(args).map(|_| 0),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            process::exit(ErrorCode::Error.as_u32() as i32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_size() {
        assert_eq!(cli_parse_size("4096").unwrap(), 4096);
        assert_eq!(cli_parse_size(" 4K").unwrap(), 4096);
        assert_eq!(cli_parse_size("2 M").unwrap(), 2 << 20);
        assert_eq!(cli_parse_size("1G").unwrap(), 1 << 30);
        assert!(cli_parse_size("1T").is_err());
        assert!(cli_parse_size("K").is_err());
        assert!(cli_parse_size("18446744073709551615K").is_err());
    }

    #[test]
    fn test_cli_parse_hexstr() {
        assert_eq!(cli_parse_hexstr("").unwrap(), CliHexStr(Vec::new()));
        assert_eq!(cli_parse_hexstr("aB01").unwrap(), CliHexStr(vec![0xab, 0x01]));
        assert_eq!(cli_parse_hexstr("abc").unwrap(), CliHexStr(vec![0x0a, 0xbc]));
        assert!(cli_parse_hexstr("xy").is_err());
    }

    fn write_verity_args(hash_tree_offset: u64, fec_offset: u64) -> CliWriteVerityArgs {
        CliWriteVerityArgs {
            image: PathBuf::from("image"),
            block_size: 4096,
            hash_algorithm: "sha256".to_owned(),
            salt: CliHexStr::default(),
            data_size: 16 * 4096,
            hash_tree_offset,
            hash_tree_size: 4096,
            fec_offset,
            fec_size: 2 * 4096,
            fec_roots: 2,
        }
    }

    #[test]
    fn test_cli_verity_layout() {
        let (layout, metadata_end) = cli_verity_layout(&write_verity_args(16 * 4096, 17 * 4096)).unwrap();
        assert_eq!(layout.fec_data_size, 17 * 4096);
        assert_eq!(metadata_end, 19 * 4096);

        assert!(cli_verity_layout(&write_verity_args(u64::MAX - 100, 17 * 4096)).is_err());
        assert!(cli_verity_layout(&write_verity_args(16 * 4096, u64::MAX - 4096)).is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory as _;
        Cli::command().debug_assert();
    }
}
