use anyhow::{Context as _, Result};

use ln_swap_sdk::models::{
    ListPaymentsRequest, LnPaymentDetails, Payment, PaymentDetails, PaymentStatus, PaymentType,
    PaymentTypeFilter,
};
use ln_swap_sdk::persist::SqliteStore;
use ln_swap_sdk::reverse_swap::{FullReverseSwapInfo, ReverseSwapStatus};
use ln_swap_sdk::swap::{SwapInfo, SwapStatus};

fn sample_payment(
    id: &str,
    payment_type: PaymentType,
    time: i64,
    status: PaymentStatus,
) -> Payment {
    Payment {
        id: id.to_string(),
        payment_type,
        payment_time: time,
        amount_msat: 1_000,
        fee_msat: 0,
        status,
        error: None,
        description: Some(format!("description:{id}")),
        details: PaymentDetails::Ln {
            data: LnPaymentDetails {
                payment_hash: id.to_string(),
                bolt11: format!("bolt11:{id}"),
                ..LnPaymentDetails::default()
            },
        },
        metadata: None,
    }
}

fn sample_swap(address: &str, hash: u8, created_at: i64, status: SwapStatus) -> SwapInfo {
    SwapInfo {
        bitcoin_address: address.to_string(),
        created_at,
        created_at_height: 100,
        lock_height: 144,
        payment_hash: vec![hash; 32],
        preimage: vec![2; 32],
        private_key: vec![3; 32],
        public_key: vec![4; 33],
        swapper_public_key: vec![5; 33],
        script: vec![0x51],
        bolt11: None,
        paid_msat: 0,
        confirmed_sats: 0,
        unconfirmed_sats: 0,
        total_incoming_txs: 0,
        status,
        refund_tx_ids: vec![],
        unconfirmed_tx_ids: vec![],
        confirmed_tx_ids: vec![],
        min_allowed_deposit: 1_000,
        max_allowed_deposit: 1_000_000,
        max_swapper_payable: 1_000_000,
        last_redeem_error: None,
        channel_opening_fees: None,
        confirmed_at: None,
        last_deposit_height: None,
    }
}

fn sample_reverse_swap(id: &str, height: u32) -> FullReverseSwapInfo {
    FullReverseSwapInfo {
        id: id.to_string(),
        created_at_block_height: height,
        preimage: vec![1; 32],
        private_key: vec![2; 32],
        destination_address: format!("destination:{id}"),
        timeout_block_height: height + 144,
        invoice: format!("invoice:{id}"),
        redeem_script: "00".to_string(),
        onchain_amount_sat: 99_000,
        receive_amount_sat: 98_724,
        sat_per_vbyte: 2,
        lockup_address: format!("lockup:{id}"),
        status: ReverseSwapStatus::Initial,
        lockup_txid: None,
        claim_txid: None,
    }
}

#[test]
fn payment_attempts_replace_only_failed_records() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SqliteStore::open(dir.path().join("storage.sql")).context("open sqlite store")?;

    let pending = sample_payment("pay-a", PaymentType::Sent, 10, PaymentStatus::Pending);
    assert!(store.start_payment_attempt(&pending)?);
    assert!(!store.start_payment_attempt(&pending)?, "pending attempt must not be replaced");

    let mut failed = pending.clone();
    failed.status = PaymentStatus::Failed;
    failed.error = Some("no route".to_string());
    assert!(store.update_pending_payment(&failed)?);
    assert!(!store.update_pending_payment(&failed)?, "terminal records stay put");

    let retry = sample_payment("pay-a", PaymentType::Sent, 20, PaymentStatus::Pending);
    assert!(store.start_payment_attempt(&retry)?);
    let got = store.get_payment("pay-a")?.context("pay-a missing")?;
    assert_eq!(got.status, PaymentStatus::Pending);
    assert_eq!(got.payment_time, 20);
    assert_eq!(got.error, None);

    let mut complete = retry;
    complete.status = PaymentStatus::Complete;
    assert!(store.update_pending_payment(&complete)?);
    assert!(!store.start_payment_attempt(&complete)?);
    assert_eq!(store.get_payment("pay-a")?.context("pay-a missing")?, complete);
    Ok(())
}

#[test]
fn metadata_survives_settlement_and_pending_records_can_be_dropped() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SqliteStore::open(dir.path().join("storage.sql")).context("open sqlite store")?;

    let pending = sample_payment("pay-m", PaymentType::Sent, 10, PaymentStatus::Pending);
    assert!(store.start_payment_attempt(&pending)?);
    assert!(store.set_payment_metadata("pay-m", r#"{"order":7}"#)?);
    assert!(!store.set_payment_metadata("missing", "{}")?);

    let mut complete = pending;
    complete.status = PaymentStatus::Complete;
    assert!(store.update_pending_payment(&complete)?);
    let got = store.get_payment("pay-m")?.context("pay-m missing")?;
    assert_eq!(got.status, PaymentStatus::Complete);
    assert_eq!(got.metadata.as_deref(), Some(r#"{"order":7}"#));
    assert!(!store.delete_pending_payment("pay-m")?, "settled records are kept");

    let incoming = sample_payment("pay-w", PaymentType::Received, 11, PaymentStatus::Pending);
    assert!(store.start_payment_attempt(&incoming)?);
    assert!(store.delete_pending_payment("pay-w")?);
    assert!(store.get_payment("pay-w")?.is_none());
    Ok(())
}

#[test]
fn list_payments_filters_and_pages() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SqliteStore::open(dir.path().join("storage.sql")).context("open sqlite store")?;

    store.insert_payment(&sample_payment("a", PaymentType::Sent, 10, PaymentStatus::Complete))?;
    store.insert_payment(&sample_payment("b", PaymentType::Received, 20, PaymentStatus::Complete))?;
    store.insert_payment(&sample_payment("c", PaymentType::Sent, 30, PaymentStatus::Failed))?;
    store.insert_payment(&sample_payment("d", PaymentType::Sent, 40, PaymentStatus::Pending))?;

    let ids = |payments: Vec<Payment>| payments.into_iter().map(|p| p.id).collect::<Vec<_>>();

    assert_eq!(ids(store.list_payments(&ListPaymentsRequest::default())?), ["d", "b", "a"]);
    assert_eq!(
        ids(store.list_payments(&ListPaymentsRequest {
            include_failures: Some(true),
            ..ListPaymentsRequest::default()
        })?),
        ["d", "c", "b", "a"]
    );
    assert_eq!(
        ids(store.list_payments(&ListPaymentsRequest {
            filter: PaymentTypeFilter::Sent,
            ..ListPaymentsRequest::default()
        })?),
        ["d", "a"]
    );
    assert_eq!(
        ids(store.list_payments(&ListPaymentsRequest {
            from_timestamp: Some(15),
            to_timestamp: Some(35),
            include_failures: Some(true),
            ..ListPaymentsRequest::default()
        })?),
        ["c", "b"]
    );
    assert_eq!(
        ids(store.list_payments(&ListPaymentsRequest {
            offset: Some(1),
            limit: Some(1),
            ..ListPaymentsRequest::default()
        })?),
        ["b"]
    );
    Ok(())
}

#[test]
fn swaps_are_keyed_by_address_and_hash() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("nested").join("storage.sql");
    let mut store = SqliteStore::open(path.clone()).context("open sqlite store")?;
    assert_eq!(store.path(), path.as_path());

    let a = sample_swap("bcrt1qa", 0xa1, 10, SwapStatus::WaitingDeposit);
    let b = sample_swap("bcrt1qb", 0xb1, 20, SwapStatus::WaitingDeposit);
    store.insert_swap(&a)?;
    store.insert_swap(&b)?;
    assert!(store.insert_swap(&a).is_err(), "addresses are never reused");

    let mut refundable = b.clone();
    refundable.status = SwapStatus::Refundable;
    refundable.confirmed_sats = 5_000_000;
    store.update_swap(&refundable)?;

    assert_eq!(store.get_swap("bcrt1qb")?.context("swap b missing")?, refundable);
    assert_eq!(store.get_swap_by_hash(&[0xa1; 32])?.context("swap a missing")?, a);
    assert!(store.get_swap_by_hash(&[0xff; 32])?.is_none());

    let all = store.list_swaps(&[])?;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].bitcoin_address, "bcrt1qa");
    let refundables = store.list_swaps(&[SwapStatus::Refundable])?;
    assert_eq!(refundables, vec![refundable]);

    let err = store
        .update_swap(&sample_swap("bcrt1qmissing", 0xcc, 0, SwapStatus::Expired))
        .unwrap_err();
    assert!(err.to_string().contains("swap not found"));
    Ok(())
}

#[test]
fn reverse_swaps_and_settings_survive_reopen() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("storage.sql");

    {
        let mut store = SqliteStore::open(path.clone()).context("open sqlite store")?;
        let mut rsi = sample_reverse_swap("rs-b", 300);
        store.insert_reverse_swap(&sample_reverse_swap("rs-a", 200))?;
        store.insert_reverse_swap(&rsi)?;
        rsi.status = ReverseSwapStatus::CompletedSeen;
        rsi.claim_txid = Some("claim-b".to_string());
        store.update_reverse_swap(&rsi)?;

        store.set_setting("lsp_id", "lsp-1")?;
        store.set_json_setting("static_backup", &vec!["backup-1".to_string()])?;
        store.set_open_channel_fee("hash-a", 1_000_000)?;
    }

    let store = SqliteStore::open(path).context("reopen sqlite store")?;
    let swaps = store.list_reverse_swaps()?;
    assert_eq!(
        swaps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        ["rs-a", "rs-b"]
    );
    let rsi = store.get_reverse_swap("rs-b")?.context("rs-b missing")?;
    assert_eq!(rsi.status, ReverseSwapStatus::CompletedSeen);
    assert_eq!(rsi.claim_txid.as_deref(), Some("claim-b"));

    assert_eq!(store.get_setting("lsp_id")?.as_deref(), Some("lsp-1"));
    assert_eq!(store.get_setting("missing")?, None);
    assert_eq!(
        store.get_json_setting::<Vec<String>>("static_backup")?,
        Some(vec!["backup-1".to_string()])
    );
    assert_eq!(store.open_channel_fee("hash-a")?, Some(1_000_000));
    assert_eq!(store.open_channel_fee("hash-b")?, None);
    Ok(())
}
