// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};
use tpm2::TpmContext;

mod ladder;
mod sealed;

/// TPM measured-boot control tool
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TPM device path
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0")]
    tcti: String,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the per-boot session nonce in PCR 16
    Init,
    /// Print the boot-session nonce
    Sess,
    /// Derive a boot-stage secret from PCR 10
    Sec {
        /// derivation key
        key: String,
    },
    /// Derive an identifier bound to this TPM
    Id {
        /// derivation key
        key: String,
    },
    /// Unseal a secret file and fold it into PCR 10
    Decryptsec {
        /// sealed blob file, `-` for stdin
        file: String,
        /// derivation key
        key: String,
    },
    /// Seal fresh random bytes to the current platform state
    Mksec,
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let mut ctx = TpmContext::new(Some(&cli.tcti))?;

    match cli.command {
        Some(Commands::Init) => ladder::initialize(&mut ctx)?,
        Some(Commands::Sess) => println!("{}", ladder::sess(&mut ctx)?),
        Some(Commands::Sec { key }) => println!("{}", ladder::sec(&mut ctx, &key)?),
        Some(Commands::Id { key }) => println!("{}", ladder::id(&mut ctx, &key)?),
        Some(Commands::Decryptsec { file, key }) => ladder::decryptsec(&mut ctx, &file, &key)?,
        Some(Commands::Mksec) => print!("{}", ladder::mksec(&mut ctx)?),
        None => ladder::print_pcrs(&mut ctx)?,
    }

    Ok(())
}
