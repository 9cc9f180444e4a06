//! Per-resource document policies.
//!
//! Each watched resource contributes the few facts ingestion needs about its
//! documents: whether the document carries the identity fields, the numeric
//! instance id, a display name and the owning tenant. Policies are looked up
//! by [`CursorType`] through a [`PolicyRegistry`].


use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::event::doc;
use crate::CursorType;
use crate::Error;
use crate::Result;

pub const TENANT_FIELD: &str = "tenant_id";
pub const SUPPLIER_ACCOUNT_FIELD: &str = "bk_supplier_account";

pub trait ResourcePolicy: Send + Sync + 'static {
    /// Rejects documents missing the fields ingestion relies on.
    fn validate(
        &self,
        doc: &Value,
    ) -> Result<()>;

    /// Numeric id of the affected business object, 0 when absent.
    fn instance_id(
        &self,
        doc: &Value,
    ) -> i64;

    fn display_name(
        &self,
        doc: &Value,
    ) -> String;

    fn tenant_id(
        &self,
        doc: &Value,
    ) -> String {
        doc::get_str(doc, TENANT_FIELD)
            .or_else(|| doc::get_str(doc, SUPPLIER_ACCOUNT_FIELD))
            .unwrap_or_default()
            .to_string()
    }
}

/// Policy driven by the id and name field names of a resource.
#[derive(Debug, Clone)]
pub struct FieldPolicy {
    id_field: &'static str,
    name_field: Option<&'static str>,
    required: &'static [&'static str],
}

impl FieldPolicy {
    pub const fn new(
        id_field: &'static str,
        name_field: Option<&'static str>,
        required: &'static [&'static str],
    ) -> Self {
        Self {
            id_field,
            name_field,
            required,
        }
    }
}

impl ResourcePolicy for FieldPolicy {
    fn validate(
        &self,
        doc: &Value,
    ) -> Result<()> {
        if !doc.is_object() {
            return Err(Error::InvalidDocument("document is not an object".to_string()));
        }
        for field in std::iter::once(&self.id_field).chain(self.required.iter()) {
            if !doc::has_field(doc, field) {
                return Err(Error::InvalidDocument(format!("missing field {field}")));
            }
        }
        Ok(())
    }

    fn instance_id(
        &self,
        doc: &Value,
    ) -> i64 {
        doc::get_i64(doc, self.id_field).unwrap_or(0)
    }

    fn display_name(
        &self,
        doc: &Value,
    ) -> String {
        self.name_field
            .and_then(|f| doc::get_path(doc, f))
            .and_then(doc::value_as_string)
            .unwrap_or_default()
    }
}

/// Association policy: identity is the association id, both object ids are required.
#[derive(Debug, Clone, Default)]
pub struct InstAsstPolicy;

impl ResourcePolicy for InstAsstPolicy {
    fn validate(
        &self,
        doc: &Value,
    ) -> Result<()> {
        for field in ["id", "bk_obj_id", "bk_asst_obj_id"] {
            if !doc::has_field(doc, field) {
                return Err(Error::InvalidDocument(format!("missing field {field}")));
            }
        }
        Ok(())
    }

    fn instance_id(
        &self,
        doc: &Value,
    ) -> i64 {
        doc::get_i64(doc, "id").unwrap_or(0)
    }

    fn display_name(
        &self,
        doc: &Value,
    ) -> String {
        doc::get_str(doc, "bk_asst_inst_id")
            .or_else(|| doc::get_str(doc, "bk_obj_asst_id"))
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Clone)]
pub struct PolicyRegistry {
    policies: HashMap<CursorType, Arc<dyn ResourcePolicy>>,
    fallback: Arc<dyn ResourcePolicy>,
}

impl PolicyRegistry {
    pub fn get(
        &self,
        resource: CursorType,
    ) -> Arc<dyn ResourcePolicy> {
        self.policies.get(&resource).cloned().unwrap_or_else(|| self.fallback.clone())
    }

    /// Replaces the policy of one resource.
    pub fn register(
        &mut self,
        resource: CursorType,
        policy: Arc<dyn ResourcePolicy>,
    ) {
        self.policies.insert(resource, policy);
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut policies: HashMap<CursorType, Arc<dyn ResourcePolicy>> = HashMap::new();
        let mut add = |t: CursorType, p: FieldPolicy| {
            policies.insert(t, Arc::new(p));
        };

        add(CursorType::Host, FieldPolicy::new("bk_host_id", Some("bk_host_innerip"), &[]));
        add(
            CursorType::ModuleHostRelation,
            FieldPolicy::new("bk_host_id", None, &["bk_module_id", "bk_biz_id"]),
        );
        add(CursorType::Biz, FieldPolicy::new("bk_biz_id", Some("bk_biz_name"), &[]));
        add(CursorType::Set, FieldPolicy::new("bk_set_id", Some("bk_set_name"), &["bk_biz_id"]));
        add(
            CursorType::Module,
            FieldPolicy::new("bk_module_id", Some("bk_module_name"), &["bk_biz_id"]),
        );
        add(
            CursorType::ObjectBase,
            FieldPolicy::new("bk_inst_id", Some("bk_inst_name"), &["bk_obj_id"]),
        );
        add(
            CursorType::MainlineInstance,
            FieldPolicy::new("bk_inst_id", Some("bk_inst_name"), &["bk_obj_id"]),
        );
        add(
            CursorType::Process,
            FieldPolicy::new("bk_process_id", Some("bk_process_name"), &[]),
        );
        add(
            CursorType::ProcessInstanceRelation,
            FieldPolicy::new("bk_process_id", None, &["bk_host_id"]),
        );
        add(CursorType::HostIdentifier, FieldPolicy::new("bk_host_id", None, &[]));
        add(
            CursorType::BizSet,
            FieldPolicy::new("bk_biz_set_id", Some("bk_biz_set_name"), &[]),
        );
        add(CursorType::BizSetRelation, FieldPolicy::new("bk_biz_set_id", None, &[]));
        add(CursorType::Plat, FieldPolicy::new("bk_cloud_id", Some("bk_cloud_name"), &[]));
        add(CursorType::Project, FieldPolicy::new("id", Some("bk_project_name"), &[]));
        add(CursorType::KubeCluster, FieldPolicy::new("id", Some("name"), &[]));
        add(CursorType::KubeNode, FieldPolicy::new("id", Some("name"), &["bk_cluster_id"]));
        add(CursorType::KubeNamespace, FieldPolicy::new("id", Some("name"), &["bk_cluster_id"]));
        add(CursorType::KubeWorkload, FieldPolicy::new("id", Some("name"), &["bk_namespace_id"]));
        add(CursorType::KubePod, FieldPolicy::new("id", Some("name"), &["bk_namespace_id"]));

        policies.insert(CursorType::InstAsst, Arc::new(InstAsstPolicy));

        Self {
            policies,
            fallback: Arc::new(FieldPolicy::new("id", None, &[])),
        }
    }
}
