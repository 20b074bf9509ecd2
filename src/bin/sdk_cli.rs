use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use ln_swap_sdk::keys::check_message;
use ln_swap_sdk::lightning::invoice::parse_invoice;
use ln_swap_sdk::models::{
    ListPaymentsRequest, ReceivePaymentRequest, SendPaymentRequest, SignMessageRequest,
};
use ln_swap_sdk::swap::ReceiveOnchainRequest;
use ln_swap_sdk::{Backends, InputParser, Network, NodeConfig, NodeSession};
use serde::Serialize;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_enum, default_value_t = Network::Bitcoin)]
    network: Network,

    #[arg(long, default_value = ".ln-swap-sdk")]
    working_dir: PathBuf,

    /// Hex-encoded wallet seed, required by commands that talk to the node.
    #[arg(long)]
    seed: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decode a BOLT11 invoice without network access.
    ParseInvoice { bolt11: String },
    /// Classify any user input (address, invoice, LNURL, node id, URL).
    ParseInput { input: String },
    ListPayments,
    NodeInfo,
    SendPayment {
        bolt11: String,

        #[arg(long)]
        amount_msat: Option<u64>,
    },
    ReceivePayment {
        #[arg(long)]
        amount_msat: u64,

        #[arg(long, default_value = "")]
        description: String,
    },
    ReceiveOnchain,
    ListRefundables,
    /// Sign a message with the node key.
    SignMessage { message: String },
    /// Verify a node signature offline.
    CheckMessage {
        message: String,
        pubkey: String,
        signature: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encode output")?);
    Ok(())
}

fn config_for(args: &Args) -> NodeConfig {
    let mut config = match args.network {
        Network::Regtest => NodeConfig::regtest(args.working_dir.clone()),
        _ => NodeConfig::production(args.working_dir.clone()),
    };
    config.network = args.network;
    config
}

async fn connected_session(args: &Args) -> Result<NodeSession> {
    let seed = args.seed.as_deref().context("--seed is required for this command")?;
    let seed = hex::decode(seed).context("decode seed hex")?;
    let config = config_for(args);
    let backends = Backends::from_config(&config)?;
    let session = NodeSession::new(config, backends)?;
    session.connect(&seed, true).await?;
    session.sync().await?;
    Ok(session)
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_swap_sdk::logging::init().ok();
    let args = Args::parse();

    match &args.command {
        Command::ParseInvoice { bolt11 } => {
            let invoice = parse_invoice(bolt11, args.network)?;
            print_json(&invoice)?;
        }
        Command::ParseInput { input } => {
            let parser = InputParser::new(args.network, reqwest::Client::new());
            print_json(&parser.parse(input).await?)?;
        }
        Command::ListPayments => {
            let config = config_for(&args);
            let session = NodeSession::new(config.clone(), Backends::from_config(&config)?)?;
            print_json(&session.list_payments(&ListPaymentsRequest::default())?)?;
        }
        Command::NodeInfo => {
            let session = connected_session(&args).await?;
            print_json(&session.node_info()?)?;
            session.disconnect().await?;
        }
        Command::SendPayment {
            bolt11,
            amount_msat,
        } => {
            let session = connected_session(&args).await?;
            let payment = session
                .send_payment(SendPaymentRequest {
                    bolt11: bolt11.clone(),
                    amount_msat: *amount_msat,
                    label: None,
                })
                .await?;
            print_json(&payment)?;
            session.disconnect().await?;
        }
        Command::ReceivePayment {
            amount_msat,
            description,
        } => {
            let session = connected_session(&args).await?;
            let resp = session
                .receive_payment(ReceivePaymentRequest {
                    amount_msat: *amount_msat,
                    description: description.clone(),
                    ..Default::default()
                })
                .await?;
            print_json(&resp)?;
            session.disconnect().await?;
        }
        Command::ReceiveOnchain => {
            let session = connected_session(&args).await?;
            print_json(&session.receive_onchain(ReceiveOnchainRequest::default()).await?)?;
            session.disconnect().await?;
        }
        Command::ListRefundables => {
            let config = config_for(&args);
            let session = NodeSession::new(config.clone(), Backends::from_config(&config)?)?;
            print_json(&session.list_refundables()?)?;
        }
        Command::SignMessage { message } => {
            let session = connected_session(&args).await?;
            let req = SignMessageRequest {
                message: message.clone(),
            };
            print_json(&session.sign_message(req).await?)?;
            session.disconnect().await?;
        }
        Command::CheckMessage {
            message,
            pubkey,
            signature,
        } => {
            let is_valid = check_message(message, pubkey, signature)?;
            print_json(&serde_json::json!({ "is_valid": is_valid }))?;
        }
    }

    Ok(())
}
