use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use tillsync_model::{ModelError, Record, TableRegistry, parse_timestamp};
use tillsync_types::TenantId;

fn orders() -> tillsync_model::TableSpec {
    *TableRegistry::standard().get("orders").unwrap()
}

// ── from_json ────────────────────────────────────────────────────

#[test]
fn lifts_id_tenant_and_deleted_at() {
    let rec = Record::from_json(
        &orders(),
        json!({"id": 7, "tenantId": "r1", "deletedAt": null, "status": "open"}),
    )
    .unwrap();

    assert_eq!(rec.id, 7);
    assert_eq!(rec.tenant_id, Some(TenantId::new("r1").unwrap()));
    assert!(!rec.is_deleted());
    assert_eq!(rec.get_str("status"), Some("open"));
    assert!(rec.get("id").is_none());
}

#[test]
fn parses_declared_date_fields_only() {
    let rec = Record::from_json(
        &orders(),
        json!({
            "id": 1,
            "createdAt": "2024-03-01T10:00:00Z",
            "note": "2024-03-01T10:00:00Z"
        }),
    )
    .unwrap();

    assert_eq!(
        rec.get_date("createdAt"),
        Some(&Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
    );
    assert_eq!(rec.get_str("note"), Some("2024-03-01T10:00:00Z"));
}

#[test]
fn unparsable_date_stays_as_text() {
    let rec = Record::from_json(&orders(), json!({"id": 1, "closedAt": "soon"})).unwrap();
    assert!(rec.get_date("closedAt").is_none());
    assert_eq!(rec.get_str("closedAt"), Some("soon"));
}

#[test]
fn blank_tenant_is_untagged() {
    let rec = Record::from_json(&orders(), json!({"id": 1, "tenantId": "  "})).unwrap();
    assert_eq!(rec.tenant_id, None);
}

#[test]
fn missing_id_is_rejected() {
    let err = Record::from_json(&orders(), json!({"status": "open"})).unwrap_err();
    assert!(matches!(err, ModelError::MissingId));
}

#[test]
fn non_object_is_rejected() {
    let err = Record::from_json(&orders(), json!([1, 2])).unwrap_err();
    assert!(matches!(err, ModelError::NotAnObject));
}

// ── to_json ──────────────────────────────────────────────────────

#[test]
fn to_json_restores_lifted_fields() {
    let tenant = TenantId::new("r1").unwrap();
    let mut rec = Record::new(3).with_tenant(&tenant).with("status", "paid");
    rec.set_date("closedAt", Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());

    assert_eq!(
        rec.to_json(),
        json!({
            "id": 3,
            "tenantId": "r1",
            "deletedAt": null,
            "status": "paid",
            "closedAt": "2024-01-02T03:04:05.000Z"
        })
    );
}

#[test]
fn json_form_reads_back_identically() {
    let spec = orders();
    let rec = Record::from_json(
        &spec,
        json!({"id": 9, "tenantId": "r1", "createdAt": "2024-05-05T05:05:05.500Z", "total": 12.5}),
    )
    .unwrap();
    let again = Record::from_json(&spec, rec.to_json()).unwrap();
    assert_eq!(rec, again);
}

// ── references & soft delete ─────────────────────────────────────

#[test]
fn reference_accepts_numeric_strings() {
    let rec = Record::new(1).with("categoryId", "12");
    assert_eq!(rec.reference("categoryId"), Some(12));
    let rec = Record::new(1).with("categoryId", 4);
    assert_eq!(rec.reference("categoryId"), Some(4));
    let rec = Record::new(1).with("categoryId", json!(null));
    assert_eq!(rec.reference("categoryId"), None);
}

#[test]
fn set_reference_none_writes_null() {
    let mut rec = Record::new(1).with("customerId", 5);
    rec.set_reference("customerId", None);
    assert_eq!(rec.get("customerId"), Some(&json!(null)));
}

#[test]
fn soft_delete_marks_record() {
    let mut rec = Record::new(1);
    rec.soft_delete(Utc::now());
    assert!(rec.is_deleted());
    assert!(rec.to_json()["deletedAt"].is_string());
}

// ── parse_timestamp ──────────────────────────────────────────────

#[test]
fn parse_timestamp_shapes() {
    let expected = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
    assert_eq!(parse_timestamp("2024-06-01T12:30:00+00:00"), Some(expected));
    assert_eq!(parse_timestamp("2024-06-01T14:30:00+02:00"), Some(expected));
    assert_eq!(parse_timestamp("2024-06-01T12:30:00"), Some(expected));
    assert_eq!(parse_timestamp("2024-06-01 12:30:00.000"), Some(expected));
    assert_eq!(
        parse_timestamp("2024-06-01"),
        Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
    );
    assert_eq!(parse_timestamp("yesterday"), None);
}
