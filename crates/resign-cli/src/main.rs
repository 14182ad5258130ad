//! Command-line front end for re-signing iOS Mach-O images and bundles.
//!
//! Without credentials a Mach-O is only inspected (or verified with `-C`).
//! Directories are always signed as application bundles.

use clap::{ArgAction, Parser};
use log::LevelFilter;
use resign::{sign_target, SignRequest};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "resign", about = "iOS re-signing tool", disable_version_flag = true)]
struct Cli {
    /// Mach-O file or application folder
    #[arg(required_unless_present = "version")]
    input: Option<PathBuf>,

    /// Certificate file (PEM or DER)
    #[arg(short = 'c', long = "cert")]
    certificate: Option<PathBuf>,

    /// Private key file (PEM, DER or .p12)
    #[arg(short = 'k', long = "pkey")]
    private_key: Option<PathBuf>,

    /// Provisioning profile
    #[arg(short = 'm', long = "prov")]
    provisioning_profile: Option<PathBuf>,

    /// Password for the private key or .p12 file
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Ad-hoc signature, no identity
    #[arg(short = 'a', long)]
    adhoc: bool,

    /// Only emit the SHA-256 CodeDirectory
    #[arg(short = '2', long = "sha256_only")]
    sha256_only: bool,

    /// New bundle identifier
    #[arg(short = 'b', long = "bundle_id")]
    bundle_id: Option<String>,

    /// New bundle display name
    #[arg(short = 'n', long = "bundle_name")]
    bundle_name: Option<String>,

    /// New bundle version
    #[arg(short = 'r', long = "bundle_version")]
    bundle_version: Option<String>,

    /// Entitlements plist replacing the profile's
    #[arg(short = 'e', long)]
    entitlements: Option<PathBuf>,

    /// Dylib to inject; repeat to inject several, in order
    #[arg(short = 'l', long = "dylib", action = ArgAction::Append)]
    dylibs: Vec<String>,

    /// Inject dylibs as LC_LOAD_WEAK_DYLIB
    #[arg(short = 'w', long)]
    weak: bool,

    /// Re-sign even if a valid signature is present
    #[arg(short = 'f', long)]
    force: bool,

    /// Verify the existing signature instead of printing it
    #[arg(short = 'C', long)]
    check: bool,

    /// Folder for temporary files
    #[arg(short = 't', long = "temp_folder")]
    temp_folder: Option<PathBuf>,

    /// Debug output, keeps intermediate files in .resign_debug
    #[arg(short = 'd', long)]
    debug: bool,

    /// Only print errors
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Print the version
    #[arg(short = 'v', long)]
    version: bool,
}

impl Cli {
    fn request(self, input: PathBuf) -> SignRequest {
        let mut request = SignRequest::new(input)
            .adhoc(self.adhoc)
            .sha256_only(self.sha256_only)
            .dylibs(self.dylibs)
            .weak_inject(self.weak)
            .force(self.force)
            .verify_only(self.check)
            .debug(self.debug)
            .quiet(self.quiet);
        if let Some(path) = self.certificate {
            request = request.certificate(path);
        }
        if let Some(path) = self.private_key {
            request = request.private_key(path);
        }
        if let Some(path) = self.provisioning_profile {
            request = request.provisioning_profile(path);
        }
        if let Some(password) = self.password {
            request = request.password(password);
        }
        if let Some(id) = self.bundle_id {
            request = request.bundle_id(id);
        }
        if let Some(name) = self.bundle_name {
            request = request.bundle_name(name);
        }
        if let Some(version) = self.bundle_version {
            request = request.bundle_version(version);
        }
        if let Some(path) = self.entitlements {
            request = request.entitlements(path);
        }
        if let Some(path) = self.temp_folder {
            request = request.temp_folder(path);
        }
        request
    }
}

fn init_logging(debug: bool, quiet: bool) {
    let log_level = if quiet {
        LevelFilter::Error
    } else if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }
    builder.init();
}

fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("version: {}", resign::version());
        return;
    }

    init_logging(cli.debug, cli.quiet);

    let Some(input) = cli.input.clone() else {
        process::exit(resign::ExitCode::Failure.code());
    };
    let code = sign_target(&cli.request(input));
    process::exit(code.code());
}
