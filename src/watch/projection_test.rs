use serde_json::json;
use serde_json::Value;

use super::*;

fn fields(names: &[&str]) -> Vec<String> {
    names.iter().map(|f| f.to_string()).collect()
}

#[test]
fn empty_field_list_keeps_the_whole_document() {
    let doc = json!({"bk_host_id": 1, "bk_host_name": "a"});
    assert_eq!(project_fields(doc.clone(), &[]), doc);
}

#[test]
fn projection_keeps_requested_keys_and_nulls_missing_ones() {
    let doc = json!({"bk_host_id": 1, "bk_host_name": "a", "bk_comment": "c"});
    let projected = project_fields(doc, &fields(&["bk_host_id", "bk_cloud_id"]));
    assert_eq!(projected, json!({"bk_host_id": 1, "bk_cloud_id": null}));
}

#[test]
fn non_object_details_are_not_projected() {
    assert_eq!(project_fields(Value::Null, &fields(&["a"])), Value::Null);
    assert_eq!(project_fields(json!([1, 2]), &fields(&["a"])), json!([1, 2]));
}

#[test]
fn stored_detail_extracts_the_document() {
    let raw = r#"{"oid":"o1","detail":{"bk_host_id":1}}"#;
    assert_eq!(stored_detail(raw), Some(json!({"bk_host_id": 1})));
    assert_eq!(stored_detail(r#"{"oid":"o1"}"#), Some(Value::Null));
}

#[test]
fn unparsable_cache_values_are_ignored() {
    assert_eq!(stored_detail("not json"), None);
    assert_eq!(stored_detail("[1,2]"), None);
}
