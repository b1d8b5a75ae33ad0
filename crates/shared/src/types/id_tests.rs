use super::*;
use std::str::FromStr;
use uuid::Uuid;

#[test]
fn test_typed_id_creation() {
    let id = TenantId::new();
    assert!(!id.to_string().is_empty());
}

#[test]
fn test_typed_id_from_uuid() {
    let uuid = Uuid::new_v4();
    let id = TenantId::from_uuid(uuid);
    assert_eq!(id.into_inner(), uuid);
}

#[test]
fn test_typed_id_is_time_ordered() {
    let first = TenantId::new();
    let second = TenantId::new();
    assert_ne!(first, second);
    assert_eq!(first.into_inner().get_version_num(), 7);
}

#[test]
fn test_typed_id_display() {
    let uuid = Uuid::new_v4();
    let id = TenantId::from_uuid(uuid);
    assert_eq!(format!("{id}"), uuid.to_string());
}

#[test]
fn test_typed_id_from_str() {
    let uuid = Uuid::new_v4();
    let id = TenantId::from_str(&uuid.to_string()).unwrap();
    assert_eq!(id.into_inner(), uuid);
}

#[test]
fn test_typed_id_from_str_error() {
    assert!(TenantId::from_str("invalid").is_err());
}

#[test]
fn test_simple_form_has_no_hyphens() {
    let id = TenantId::from_uuid(Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap());
    assert_eq!(id.simple(), "550e8400e29b41d4a716446655440000");
}

#[test]
fn test_serde_is_transparent() {
    let uuid = Uuid::new_v4();
    let id = TenantId::from_uuid(uuid);
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{uuid}\""));
}
