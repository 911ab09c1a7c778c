// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM-backed HMAC oracle
//!
//! `import` wraps a secret file as a TPM-resident key and prints the opaque
//! key blob; `serv` loads a blob and answers `POST /hmac` with the raw
//! 32-byte HMAC-SHA256 of the request body. The device and the loaded key
//! stay open for the server lifetime, and a single lock serializes every
//! TPM command even when connections arrive in parallel.

use std::io::Read;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use rocket::data::ToByteUnit;
use rocket::http::Status;
use rocket::response::status;
use rocket::{post, routes, Data, State};
use tpm_hmac::Hmacer;
use tpm2::TpmContext;
use tracing::info;

/// TPM-backed HMAC oracle
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TPM device path
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0")]
    tcti: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import an HMAC secret into the TPM and print the key blob
    Import {
        /// secret file, `-` for stdin; the bytes are used verbatim
        file: String,
    },
    /// Serve the HMAC endpoint with a previously imported key blob
    Serv {
        /// key blob file, `-` for stdin
        keyfile: String,
        /// bind address
        #[arg(default_value = "localhost:9999")]
        bind: String,
    },
}

type Oracle = Arc<Mutex<Hmacer>>;

/// Request bodies are 1..=128 bytes; anything else is the caller's problem
const MAX_BODY: usize = 128;

#[post("/hmac", data = "<body>")]
async fn hmac_route(
    oracle: &State<Oracle>,
    body: Data<'_>,
) -> Result<Vec<u8>, status::Custom<String>> {
    let body = body
        .open(256.bytes())
        .into_bytes()
        .await
        .map_err(|e| {
            status::Custom(
                Status::BadRequest,
                format!("error reading request: {}", e),
            )
        })?
        .into_inner();

    if body.is_empty() {
        return Err(status::Custom(
            Status::BadRequest,
            "request length is zero".to_string(),
        ));
    }
    if body.len() > MAX_BODY {
        return Err(status::Custom(
            Status::BadRequest,
            "request too long".to_string(),
        ));
    }

    let oracle = oracle.inner().clone();
    let len = body.len();
    let started = Instant::now();

    // TPM commands block until the device replies; keep them off the
    // request executor
    let digest = rocket::tokio::task::spawn_blocking(move || {
        let mut hmacer = oracle.lock().unwrap_or_else(PoisonError::into_inner);
        hmacer.hmac(&body)
    })
    .await
    .map_err(|e| {
        status::Custom(
            Status::InternalServerError,
            format!("error computing hmac: {}", e),
        )
    })?
    .map_err(|e| {
        status::Custom(
            Status::InternalServerError,
            format!("error computing hmac: {:#}", e),
        )
    })?;

    info!("hmac over {} bytes computed in {:?}", len, started.elapsed());
    Ok(digest.to_vec())
}

async fn serve(oracle: Oracle, bind: &str) -> Result<()> {
    let addr: SocketAddr = bind
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve bind address {}", bind))?
        .next()
        .with_context(|| format!("bind address {} resolves to nothing", bind))?;

    info!("listening on {}", addr);

    let figment = rocket::Config::figment()
        .merge(("address", addr.ip().to_string()))
        .merge(("port", addr.port()));

    let _ = rocket::custom(figment)
        .manage(oracle)
        .mount("/", routes![hmac_route])
        .launch()
        .await
        .context("http server failed")?;

    Ok(())
}

fn read_input(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading stdin")?;
        Ok(buf)
    } else {
        Ok(fs_err::read(path)?)
    }
}

#[rocket::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Import { file } => {
            let secret = read_input(&file)?;
            let mut ctx = TpmContext::new(Some(&cli.tcti))?;
            let blob = tpm_hmac::import_key(&mut ctx, &secret)?;
            println!("{}", blob);
        }
        Commands::Serv { keyfile, bind } => {
            let blob = String::from_utf8(read_input(&keyfile)?).context("key blob is not text")?;
            let ctx = TpmContext::new(Some(&cli.tcti))?;
            let hmacer = Hmacer::load(ctx, blob.trim())?;
            serve(Arc::new(Mutex::new(hmacer)), &bind).await?;
        }
    }

    Ok(())
}
