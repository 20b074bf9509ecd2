mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context as _, Result};

use ln_swap_sdk::config::Network;
use ln_swap_sdk::keys::NodeIdentity;
use ln_swap_sdk::models::{
    Channel, ChannelState, CheckMessageRequest, ListPaymentsRequest, PaymentStatus, PaymentType,
    PaymentTypeFilter, PrepareRedeemOnchainFundsRequest, RedeemOnchainFundsRequest,
    SendPaymentRequest, SignMessageRequest, UnspentTransactionOutput,
};
use ln_swap_sdk::swap::ReceiveOnchainRequest;
use ln_swap_sdk::{BreezEvent, NodeSession, SdkError};
use support::invoice::invoice_for;
use support::mock::{
    MockLsp, Mocks, SEED, drain, fee_params, lsp, node_state, regtest_address, synced_session,
    test_config, txid,
};
use support::wait::wait_for;

async fn next_event<F>(
    rx: &mut tokio::sync::broadcast::Receiver<BreezEvent>,
    mut matches: F,
) -> Result<BreezEvent>
where
    F: FnMut(&BreezEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await?;
            if matches(&event) {
                return anyhow::Ok(event);
            }
        }
    })
    .await
    .context("timed out waiting for event")?
}

#[tokio::test]
async fn operations_require_a_connection() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    let session = NodeSession::new(test_config(dir.path()), mocks.backends())?;

    assert!(!session.is_connected().await);
    let err = session
        .send_payment(SendPaymentRequest {
            bolt11: invoice_for(Some(1_000), [0x01; 32]),
            amount_msat: None,
            label: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::NotConnected), "{err}");

    let err = session
        .receive_onchain(ReceiveOnchainRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::NotConnected), "{err}");
    assert!(matches!(session.sync().await.unwrap_err(), SdkError::NotConnected));
    assert!(session.node_info().is_err());
    assert_eq!(mocks.node.send_calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn rejected_credentials_leave_the_session_disconnected() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    mocks.node.reject_credentials.store(true, Ordering::SeqCst);
    let session = NodeSession::new(test_config(dir.path()), mocks.backends())?;

    let err = session.connect(&SEED, false).await.unwrap_err();
    assert!(matches!(err, SdkError::Auth(_)), "{err}");
    assert!(!session.is_connected().await);
    assert_eq!(session.background_tasks(), 0);

    mocks.node.reject_credentials.store(false, Ordering::SeqCst);
    session.connect(&SEED, true).await?;
    assert!(session.is_connected().await);
    Ok(())
}

#[tokio::test]
async fn connect_twice_is_rejected_and_disconnect_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    let session = NodeSession::new(test_config(dir.path()), mocks.backends())?;

    session.connect(&SEED, false).await?;
    let err = session.connect(&SEED, false).await.unwrap_err();
    assert!(matches!(err, SdkError::AlreadyConnected), "{err}");
    assert_eq!(mocks.node.connect_calls.load(Ordering::SeqCst), 1);

    wait_for("background loops", Duration::from_secs(5), || {
        let running = session.background_tasks();
        async move { anyhow::Ok((running == 2).then_some(())) }
    })
    .await?;

    session.disconnect().await?;
    assert_eq!(session.background_tasks(), 0);
    assert!(!session.is_connected().await);
    session.disconnect().await?;

    // Reconnecting starts fresh loops.
    session.connect(&SEED, false).await?;
    wait_for("background loops after reconnect", Duration::from_secs(5), || {
        let running = session.background_tasks();
        async move { anyhow::Ok((running == 2).then_some(())) }
    })
    .await?;
    session.disconnect().await?;
    assert_eq!(session.background_tasks(), 0);
    Ok(())
}

#[tokio::test]
async fn stalled_connect_times_out_without_blocking_the_session() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    *mocks.node.connect_delay.lock().unwrap() = Some(Duration::from_secs(30));
    let config = ln_swap_sdk::NodeConfig {
        payment_timeout_sec: 1,
        ..test_config(dir.path())
    };
    let session = NodeSession::new(config, mocks.backends())?;

    let (connected, is_connected) = tokio::join!(session.connect(&SEED, true), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_millis(500), session.is_connected()).await
    });
    assert_eq!(is_connected.ok(), Some(false));
    let err = connected.unwrap_err();
    assert!(matches!(err, SdkError::Timeout(_)), "{err}");
    assert!(!session.is_connected().await);

    *mocks.node.connect_delay.lock().unwrap() = None;
    session.connect(&SEED, true).await?;
    assert!(session.is_connected().await);
    Ok(())
}

#[tokio::test]
async fn signed_messages_verify_against_the_node_key() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    let session = NodeSession::new(test_config(dir.path()), mocks.backends())?;

    let req = SignMessageRequest {
        message: "hello".to_string(),
    };
    let err = session.sign_message(req.clone()).await.unwrap_err();
    assert!(matches!(err, SdkError::NotConnected), "{err}");

    session.connect(&SEED, true).await?;
    let signature = session.sign_message(req).await?.signature;
    let pubkey = NodeIdentity::from_seed(&SEED, Network::Regtest)?
        .node_pubkey()
        .to_string();

    let check = |message: &str, pubkey: &str| CheckMessageRequest {
        message: message.to_string(),
        pubkey: pubkey.to_string(),
        signature: signature.clone(),
    };
    assert!(session.check_message(check("hello", &pubkey))?.is_valid);
    assert!(!session.check_message(check("hello!", &pubkey))?.is_valid);
    let err = session.check_message(check("hello", "02zz")).unwrap_err();
    assert!(matches!(err, SdkError::Parse(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn background_loops_sync_and_report_new_blocks() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    let session = NodeSession::new(test_config(dir.path()), mocks.backends())?;
    let mut events = session.subscribe();

    session.connect(&SEED, false).await?;
    next_event(&mut events, |e| matches!(e, BreezEvent::NewBlock { block: 200 })).await?;
    wait_for("first sync", Duration::from_secs(5), || {
        let synced = session.node_info().ok();
        async move { anyhow::Ok(synced) }
    })
    .await?;

    mocks.chain.tip.store(201, Ordering::SeqCst);
    next_event(&mut events, |e| matches!(e, BreezEvent::NewBlock { block: 201 })).await?;

    session.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn exhausted_sync_retries_surface_as_backup_failed() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    mocks.chain.unavailable.store(true, Ordering::SeqCst);
    let session = NodeSession::new(test_config(dir.path()), mocks.backends())?;
    let mut events = session.subscribe();

    session.connect(&SEED, false).await?;
    let event = next_event(&mut events, |e| matches!(e, BreezEvent::BackupFailed { .. })).await?;
    let BreezEvent::BackupFailed { details } = event else {
        unreachable!();
    };
    assert!(details.error.contains("esplora unavailable"), "{}", details.error);
    // One initial attempt plus one retry.
    assert!(mocks.node.pull_calls.load(Ordering::SeqCst) >= 2);

    session.disconnect().await?;
    assert_eq!(session.background_tasks(), 0);
    Ok(())
}

#[tokio::test]
async fn sync_events_arrive_in_order() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    let session = NodeSession::new(test_config(dir.path()), mocks.backends())?;
    let mut events = session.subscribe();

    session.connect(&SEED, true).await?;
    session.sync().await?;
    mocks.chain.tip.store(203, Ordering::SeqCst);
    session.sync().await?;
    session.sync().await?;

    let blocks: Vec<u32> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            BreezEvent::NewBlock { block } => Some(block),
            _ => None,
        })
        .collect();
    assert_eq!(blocks, vec![200, 203]);
    assert_eq!(session.node_info()?.id, support::mock::node_id());
    Ok(())
}

#[tokio::test]
async fn backup_is_stored_and_announced() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    let session = synced_session(&mocks, test_config(dir.path())).await;
    assert_eq!(session.static_backup()?.backup, None);

    let mut events = session.subscribe();
    session.backup().await?;

    assert_eq!(
        drain(&mut events),
        vec![BreezEvent::BackupStarted, BreezEvent::BackupSucceeded]
    );
    assert_eq!(
        session.static_backup()?.backup,
        Some(vec!["channel-backup-1".to_string()])
    );
    Ok(())
}

#[tokio::test]
async fn selected_lsp_and_node_state_persist_across_sessions() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks {
        lsp: std::sync::Arc::new(MockLsp::with(vec![
            lsp("lsp-1", vec![fee_params(2_000_000, 10_000)]),
            lsp("lsp-2", vec![fee_params(500_000, 1_000)]),
        ])),
        ..Mocks::default()
    };

    {
        let session = synced_session(&mocks, test_config(dir.path())).await;
        assert_eq!(session.lsp_id()?.as_deref(), Some("lsp-1"));
        assert_eq!(session.list_lsps().await?.len(), 2);

        session.set_lsp_id("lsp-2").await?;
        assert_eq!(session.lsp_info().await?.id, "lsp-2");
        let fee = session.open_channel_fee(Default::default()).await?;
        assert_eq!(fee.fee_params.proportional, 1_000);

        let err = session.set_lsp_id("lsp-9").await.unwrap_err();
        assert!(matches!(err, SdkError::Generic(_)), "{err}");
        assert_eq!(session.lsp_id()?.as_deref(), Some("lsp-2"));
        session.disconnect().await?;
    }

    let reopened = NodeSession::new(test_config(dir.path()), mocks.backends())?;
    assert_eq!(reopened.lsp_id()?.as_deref(), Some("lsp-2"));
    assert_eq!(reopened.node_info()?, node_state(10_000_000));
    Ok(())
}

#[tokio::test]
async fn closing_channels_become_payments() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    let session = synced_session(&mocks, test_config(dir.path())).await;

    let channel = Channel {
        funding_txid: txid(0x0c),
        short_channel_id: Some("200x1x0".to_string()),
        state: ChannelState::PendingClose,
        spendable_msat: 7_000_000,
        receivable_msat: 0,
        closed_at: None,
        closing_txid: Some(txid(0x0d)),
        alias_remote: None,
    };
    mocks.node.sync_response.lock().unwrap().channels = vec![channel.clone()];
    session.sync().await?;

    let closed_only = ListPaymentsRequest {
        filter: PaymentTypeFilter::ClosedChannel,
        ..ListPaymentsRequest::default()
    };
    let payments = session.list_payments(&closed_only)?;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].id, txid(0x0c));
    assert_eq!(payments[0].status, PaymentStatus::Pending);
    assert_eq!(payments[0].payment_type, PaymentType::ClosedChannel);
    assert_eq!(payments[0].amount_msat, 7_000_000);

    mocks.node.sync_response.lock().unwrap().channels = vec![Channel {
        state: ChannelState::Closed,
        closed_at: Some(1_700_000_000),
        ..channel
    }];
    session.sync().await?;
    let payments = session.list_payments(&closed_only)?;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Complete);
    Ok(())
}

#[tokio::test]
async fn onchain_funds_are_swept_to_a_valid_address() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    {
        let mut resp = mocks.node.sync_response.lock().unwrap();
        resp.node_state.utxos = vec![
            UnspentTransactionOutput {
                txid: vec![1; 32],
                outnum: 0,
                amount_millisatoshi: 30_000_000,
                address: regtest_address(0x31),
                reserved: false,
            },
            UnspentTransactionOutput {
                txid: vec![2; 32],
                outnum: 1,
                amount_millisatoshi: 20_000_000,
                address: regtest_address(0x32),
                reserved: true,
            },
        ];
    }
    let session = synced_session(&mocks, test_config(dir.path())).await;

    let prepared = session.prepare_redeem_onchain_funds(PrepareRedeemOnchainFundsRequest {
        to_address: regtest_address(0x09),
        sat_per_vbyte: 3,
    })?;
    assert!(prepared.tx_weight > 0);
    assert_eq!(prepared.tx_fee_sat, prepared.tx_weight.div_ceil(4) * 3);

    let err = session
        .redeem_onchain_funds(RedeemOnchainFundsRequest {
            to_address: "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".to_string(),
            sat_per_vbyte: 3,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::Parse(_)), "{err}");

    let resp = session
        .redeem_onchain_funds(RedeemOnchainFundsRequest {
            to_address: regtest_address(0x09),
            sat_per_vbyte: 3,
        })
        .await?;
    assert_eq!(resp.txid, txid(0xaa));
    Ok(())
}

#[tokio::test]
async fn session_parses_inputs_for_its_network() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mocks = Mocks::default();
    let session = NodeSession::new(test_config(dir.path()), mocks.backends())?;

    let address = regtest_address(0x42);
    let parsed = session.parse_input(&address).await?;
    let ln_swap_sdk::InputType::BitcoinAddress { address: data } = &parsed else {
        anyhow::bail!("expected a bitcoin address, got {parsed:?}");
    };
    assert_eq!(data.address, address);
    assert_eq!(data.amount_sat, None);

    let invoice = session.parse_invoice(&invoice_for(Some(7_000), [0x07; 32]))?;
    assert_eq!(invoice.amount_msat, Some(7_000));
    Ok(())
}
