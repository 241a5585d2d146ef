use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use tillsync_model::{
    Category, EntityRecord, ModelError, Order, PayrollEntry, Product, Record, TableRegistry,
};
use tillsync_types::TenantId;

#[test]
fn unset_fields_are_omitted() {
    let category = Category {
        id: Some(1),
        name: Some("Postres".into()),
        ..Default::default()
    };
    assert_eq!(
        serde_json::to_value(&category).unwrap(),
        json!({"id": 1, "name": "Postres"})
    );
}

#[test]
fn table_names_match_registry() {
    let registry = TableRegistry::standard();
    for table in [
        Category::TABLE,
        Product::TABLE,
        Order::TABLE,
        PayrollEntry::TABLE,
    ] {
        assert!(registry.get(table).is_some(), "{table} not registered");
    }
}

#[test]
fn entity_converts_to_record_and_back() {
    let registry = TableRegistry::standard();
    let spec = registry.get(Product::TABLE).unwrap();
    let product = Product {
        id: Some(10),
        tenant_id: Some(TenantId::new("r1").unwrap()),
        name: Some("Limonada".into()),
        category_id: Some(2),
        price: Some(3.5),
        created_at: Some(Utc.with_ymd_and_hms(2024, 2, 2, 8, 0, 0).unwrap()),
        ..Default::default()
    };

    let record = Record::from_entity(spec, &product).unwrap();
    assert_eq!(record.id, 10);
    assert_eq!(record.reference("categoryId"), Some(2));
    assert!(record.get_date("createdAt").is_some());

    let back: Product = record.to_entity().unwrap();
    assert_eq!(back, product);
}

#[test]
fn entity_without_id_cannot_become_record() {
    let registry = TableRegistry::standard();
    let spec = registry.get(Order::TABLE).unwrap();
    let err = Record::from_entity(spec, &Order::default()).unwrap_err();
    assert!(matches!(err, ModelError::MissingId));
}

#[test]
fn decode_ignores_unknown_fields() {
    let record = Record::new(4)
        .with("name", "Entradas")
        .with("productCount", 12);
    let category: Category = record.to_entity().unwrap();
    assert_eq!(category.name.as_deref(), Some("Entradas"));
    assert_eq!(category.id(), Some(4));
}

#[test]
fn set_id_assigns() {
    let mut order = Order::default();
    order.set_id(99);
    assert_eq!(order.id(), Some(99));
    assert!(order.tenant_id().is_none());
}
