//! BillingService tests that drive the service directly, without HTTP.

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal_macros::dec;
use service_core::error::AppError;
use tuition_billing_service::lifecycle::BulkAction;
use tuition_billing_service::models::{
    CreateInvoice, InvoiceStatus, PaymentMethod, PaymentStatus, RecordPayment,
};
use tuition_billing_service::services::{
    ActorContext, BillingPolicy, BillingService, BillingStore, FixedClock, MemoryActivityLog,
    MemoryStore, ScriptedGateway, ScriptedOutcome,
};
use uuid::Uuid;

struct Harness {
    billing: Arc<BillingService>,
    store: Arc<MemoryStore>,
    gateway: Arc<ScriptedGateway>,
    activity: Arc<MemoryActivityLog>,
    staff: ActorContext,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let activity = Arc::new(MemoryActivityLog::new());
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 5, 15, 9, 0, 0).unwrap(),
    ));
    let billing = BillingService::new(
        store.clone(),
        gateway.clone(),
        activity.clone(),
        clock,
        BillingPolicy::default(),
    );
    Harness {
        billing: Arc::new(billing),
        store,
        gateway,
        activity,
        staff: ActorContext::staff(Uuid::new_v4()),
    }
}

fn new_invoice(amount: rust_decimal::Decimal) -> CreateInvoice {
    CreateInvoice {
        student_id: Some(Uuid::new_v4()),
        academic_year_id: Some(Uuid::new_v4()),
        curriculum_id: Some(Uuid::new_v4()),
        amount,
        due_date: NaiveDate::from_ymd_opt(2025, 5, 31),
        ..Default::default()
    }
}

fn card(amount: rust_decimal::Decimal) -> RecordPayment {
    RecordPayment {
        amount,
        method: PaymentMethod::CreditCard,
        notes: None,
    }
}

#[tokio::test]
async fn concurrent_payments_cannot_overpay() {
    let h = harness();
    let invoice = h
        .billing
        .create_invoice(&h.staff, new_invoice(dec!(300.00)))
        .await
        .unwrap();
    let id = invoice.invoice.invoice_id;

    let attempts = (0..3).map(|_| {
        let billing = Arc::clone(&h.billing);
        let staff = h.staff.clone();
        tokio::spawn(async move { billing.record_payment(&staff, id, card(dec!(200.00))).await })
    });
    let results = futures::future::join_all(attempts).await;

    let (ok, rejected): (Vec<_>, Vec<_>) = results
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .partition(|r| r.is_ok());
    assert_eq!(ok.len(), 1);
    assert_eq!(rejected.len(), 2);
    for err in rejected {
        assert!(matches!(err, Err(AppError::ValidationError(_))));
    }

    let balance = h.billing.balance(&h.staff, id).await.unwrap();
    assert_eq!(balance.total_paid, dec!(200.00));
    assert_eq!(balance.remaining, dec!(100.00));

    // rejected attempts never reach the store or the gateway
    assert_eq!(h.store.payment_count().await, 1);
    assert_eq!(h.gateway.charges().await.len(), 1);
}

#[tokio::test]
async fn concurrent_creates_get_distinct_numbers() {
    let h = harness();

    let creates = (0..10).map(|_| {
        let billing = Arc::clone(&h.billing);
        let staff = h.staff.clone();
        tokio::spawn(async move {
            billing
                .create_invoice(&staff, new_invoice(dec!(10.00)))
                .await
        })
    });
    let mut numbers: Vec<String> = futures::future::join_all(creates)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().invoice.invoice_number)
        .collect();
    numbers.sort();
    numbers.dedup();

    assert_eq!(numbers.len(), 10);
    assert_eq!(numbers[0], "INV-202505-0001");
    assert_eq!(numbers[9], "INV-202505-0010");
}

#[tokio::test]
async fn hand_edited_number_is_skipped_by_allocation() {
    let h = harness();
    let first = h
        .billing
        .create_invoice(&h.staff, new_invoice(dec!(10.00)))
        .await
        .unwrap();

    let mut edited = first.invoice.clone();
    edited.invoice_number = "INV-202505-0002".to_string();
    h.store.save_invoice(&edited).await.unwrap();

    let next = h
        .billing
        .create_invoice(&h.staff, new_invoice(dec!(10.00)))
        .await
        .unwrap();
    assert_eq!(next.invoice.invoice_number, "INV-202505-0003");
}

#[tokio::test]
async fn scenario_300_paid_in_two_halves() {
    let h = harness();
    let id = h
        .billing
        .create_invoice(&h.staff, new_invoice(dec!(300.00)))
        .await
        .unwrap()
        .invoice
        .invoice_id;

    let first = h
        .billing
        .record_payment(&h.staff, id, card(dec!(150.00)))
        .await
        .unwrap();
    assert_eq!(first.invoice.invoice.status, InvoiceStatus::PartiallyPaid);
    assert_eq!(first.balance.remaining, dec!(150.00));

    let second = h
        .billing
        .record_payment(&h.staff, id, card(dec!(150.00)))
        .await
        .unwrap();
    assert_eq!(second.invoice.invoice.status, InvoiceStatus::Paid);
    assert!(second.invoice.invoice.paid_date.is_some());

    let err = h
        .billing
        .record_payment(&h.staff, id, card(dec!(10.00)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn declined_payment_is_recorded_as_failed() {
    let h = harness();
    let id = h
        .billing
        .create_invoice(&h.staff, new_invoice(dec!(300.00)))
        .await
        .unwrap()
        .invoice
        .invoice_id;
    h.gateway
        .push(ScriptedOutcome::Decline("insufficient funds".to_string()))
        .await;

    let err = h
        .billing
        .record_payment(&h.staff, id, card(dec!(100.00)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentDeclined(ref r) if r == "insufficient funds"));

    let payments = h.billing.list_payments(&h.staff, id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert!(payments[0].processed_utc.is_some());

    let detail = h.billing.get_invoice(&h.staff, id).await.unwrap();
    assert_eq!(detail.view.invoice.status, InvoiceStatus::Pending);
    assert_eq!(detail.balance.total_paid, dec!(0));
}

#[tokio::test]
async fn activity_entries_carry_actor_and_subject() {
    let h = harness();
    let view = h
        .billing
        .create_invoice(&h.staff, new_invoice(dec!(50.00)))
        .await
        .unwrap();
    let id = view.invoice.invoice_id;
    h.billing
        .bulk_transition(&h.staff, &[id], BulkAction::Cancel)
        .await
        .unwrap();

    let entries = h.activity.entries().await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].action, "invoice.created");
    assert_eq!(entries[0].actor_id, h.staff.actor_id);
    assert_eq!(entries[0].subject_id, id);
    assert_eq!(entries[1].action, "invoice.status_changed");
    assert_eq!(entries[1].metadata["bulk_action"], "cancel");
    assert_eq!(entries[1].metadata["from"], "pending");
    assert_eq!(entries[1].metadata["to"], "cancelled");
}

#[tokio::test]
async fn guardian_cannot_edit_or_transition() {
    let h = harness();
    let view = h
        .billing
        .create_invoice(&h.staff, new_invoice(dec!(50.00)))
        .await
        .unwrap();
    let guardian = ActorContext::guardian(Uuid::new_v4(), vec![view.invoice.student_id]);

    let err = h
        .billing
        .transition_status(&guardian, view.invoice.invoice_id, InvoiceStatus::Paid, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    // but may read their own invoice
    assert!(h
        .billing
        .get_invoice(&guardian, view.invoice.invoice_id)
        .await
        .is_ok());
}
