use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::error;
use tracing::warn;

use crate::event::doc;
use crate::event::kube_workload_kind;
use crate::event::KUBE_CONTAINER;
use crate::metrics::alarm;
use crate::metrics::EVENTS_DROPPED;
use crate::ArchiveStore;
use crate::ChainNode;
use crate::ChangeEvent;
use crate::Cursor;
use crate::CursorType;
use crate::DocumentStore;
use crate::EventDetail;
use crate::EventType;
use crate::OperType;
use crate::ResourcePolicy;
use crate::Result;

const POD_ID_FIELD: &str = "bk_pod_id";
const CONTAINERS_FIELD: &str = "containers";

/// Archived documents of the delete events of one batch, keyed by `(coll, oid)`.
pub type DeleteDetails = HashMap<(String, String), Value>;

/// Resource specific parsing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Plain,
    /// Object instances: sub resource is the object id
    ObjectInstance,
    /// Instance associations: identity is the association id, insert and delete only
    InstAsst,
    /// Kube workloads: sub resource is the workload kind of the source collection
    KubeWorkload,
    /// Kube pods: detail embeds the pod's live and archived containers
    Pod,
}

impl ParserKind {
    pub fn for_resource(resource: CursorType) -> Self {
        match resource {
            CursorType::ObjectBase | CursorType::MainlineInstance => ParserKind::ObjectInstance,
            CursorType::InstAsst => ParserKind::InstAsst,
            CursorType::KubeWorkload => ParserKind::KubeWorkload,
            CursorType::KubePod => ParserKind::Pod,
            _ => ParserKind::Plain,
        }
    }

    fn accepts(
        self,
        oper: &OperType,
    ) -> bool {
        match self {
            ParserKind::InstAsst | ParserKind::Pod => {
                matches!(oper, OperType::Insert | OperType::Delete)
            }
            _ => oper.is_data_change(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub node: ChainNode,
    /// Serialized [`EventDetail`]; empty when the detail is computed on read
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed(ParsedEvent),
    /// Event skipped for good, with the reason it was dropped
    Dropped(&'static str),
    /// The whole batch must stop; `retry` asks for a re-watch
    Abort { retry: bool },
}

/// Collects the archived documents of every delete event in `events`.
///
/// One archive lookup per `(tenant, coll)`.
pub async fn delete_details(
    archive: &dyn ArchiveStore,
    events: &[ChangeEvent],
) -> Result<DeleteDetails> {
    let mut groups: BTreeMap<(&str, &str), Vec<String>> = BTreeMap::new();
    for e in events.iter().filter(|e| e.is_delete()) {
        groups
            .entry((e.tenant_id.as_str(), e.collection.as_str()))
            .or_default()
            .push(e.oid.clone());
    }

    let mut details = DeleteDetails::new();
    for ((tenant, coll), oids) in groups {
        for archived in archive.find_by_oids(tenant, coll, &oids).await? {
            details.insert((archived.coll, archived.oid), archived.detail);
        }
    }
    Ok(details)
}

/// Turns raw change events of one resource into chain nodes and details.
#[derive(Clone)]
pub struct EventParser {
    resource: CursorType,
    kind: ParserKind,
    policy: Arc<dyn ResourcePolicy>,
    docs: Arc<dyn DocumentStore>,
    archive: Arc<dyn ArchiveStore>,
}

impl EventParser {
    pub fn new(
        resource: CursorType,
        policy: Arc<dyn ResourcePolicy>,
        docs: Arc<dyn DocumentStore>,
        archive: Arc<dyn ArchiveStore>,
    ) -> Self {
        Self {
            resource,
            kind: ParserKind::for_resource(resource),
            policy,
            docs,
            archive,
        }
    }

    pub fn kind(&self) -> ParserKind {
        self.kind
    }

    pub async fn parse(
        &self,
        event: &ChangeEvent,
        deleted: &DeleteDetails,
        id: u64,
        rid: &str,
    ) -> ParseOutcome {
        let oper = &event.operation_type;
        match oper {
            OperType::Invalidate => {
                error!(rid, coll = %event.collection, "received invalidate event, skip it");
                return self.dropped("invalidate");
            }
            OperType::Drop => {
                // deleting an object drops its instance collection
                error!(rid, coll = %event.collection, "received drop collection event, skip it");
                return self.dropped("drop");
            }
            op if !self.kind.accepts(op) => {
                error!(rid, oid = %event.oid, "received unsupported operation {op}, skip it");
                return self.dropped("unsupported_operation");
            }
            _ => {}
        }

        let mut document = if event.is_delete() {
            match deleted.get(&(event.collection.clone(), event.oid.clone())) {
                Some(d) => d.clone(),
                None => {
                    error!(
                        rid,
                        coll = %event.collection,
                        oid = %event.oid,
                        "delete event detail does not exist in archive"
                    );
                    alarm(self.resource.as_str(), "delete_detail_missing");
                    return self.dropped("delete_detail_missing");
                }
            }
        } else {
            event.document.clone()
        };

        if let Err(e) = self.policy.validate(&document) {
            error!(rid, oid = %event.oid, "received invalid {} event: {:?}", self.resource, e);
            return self.dropped("invalid_document");
        }

        let instance_id = self.policy.instance_id(&document);
        let mut cursor_oid = event.oid.clone();
        let mut sub_resource = Vec::new();

        match self.kind {
            ParserKind::Plain => {}
            ParserKind::ObjectInstance => {
                sub_resource.push(doc::get_str(&document, "bk_obj_id").unwrap_or_default().to_string());
            }
            ParserKind::InstAsst => {
                if instance_id <= 0 {
                    error!(rid, oid = %event.oid, "received association event without id, skip it");
                    return self.dropped("invalid_instance_id");
                }
                // both association halves share the id, so their cursors collide and dedup
                cursor_oid = instance_id.to_string();
                for field in ["bk_obj_id", "bk_asst_obj_id"] {
                    sub_resource.push(doc::get_str(&document, field).unwrap_or_default().to_string());
                }
            }
            ParserKind::KubeWorkload => match kube_workload_kind(&event.collection) {
                Some(kind) => sub_resource.push(kind.to_string()),
                None => {
                    error!(rid, coll = %event.collection, "received event of unknown workload kind, skip it");
                    return self.dropped("unknown_workload");
                }
            },
            ParserKind::Pod => {
                let containers = match self.pod_containers(event, instance_id, rid).await {
                    Ok(c) => c,
                    Err(e) => {
                        error!(rid, pod_id = instance_id, "get pod containers failed: {:?}", e);
                        return ParseOutcome::Abort { retry: true };
                    }
                };
                if let Some(obj) = document.as_object_mut() {
                    obj.insert(CONTAINERS_FIELD.to_string(), Value::Array(containers));
                }
            }
        }

        let cursor = match Cursor::for_event(
            self.resource,
            event.cluster_time,
            &cursor_oid,
            oper.clone(),
            instance_id,
        )
        .encode()
        {
            Ok(c) => c,
            Err(e) => {
                error!(rid, oid = %event.id(), "get {} event cursor failed: {:?}", self.resource, e);
                alarm(self.resource.as_str(), "hit_invalid_cursor");
                return ParseOutcome::Abort { retry: false };
            }
        };

        let Some(event_type) = EventType::from_oper(oper) else {
            return self.dropped("unsupported_operation");
        };

        let tenant_id = if event.tenant_id.is_empty() {
            self.policy.tenant_id(&document)
        } else {
            event.tenant_id.clone()
        };

        let detail = match serde_json::to_string(&EventDetail::from_event(event, document)) {
            Ok(d) => d,
            Err(e) => {
                error!(rid, oid = %event.id(), "marshal event detail failed: {:?}", e);
                return ParseOutcome::Abort { retry: false };
            }
        };

        ParseOutcome::Parsed(ParsedEvent {
            node: ChainNode {
                id,
                cluster_time: event.cluster_time,
                oid: event.oid.clone(),
                event_type,
                token: event.token.clone(),
                cursor,
                instance_id: instance_id.max(0),
                sub_resource,
                tenant_id,
            },
            detail,
        })
    }

    /// Live containers of an inserted pod plus the archived ones, which covers
    /// containers deleted right after creation. Deleted pods only have archived ones.
    async fn pod_containers(
        &self,
        event: &ChangeEvent,
        pod_id: i64,
        rid: &str,
    ) -> Result<Vec<Value>> {
        let tenant = event.tenant_id.as_str();
        let mut containers = Vec::new();
        if !event.is_delete() {
            containers = self
                .docs
                .find_by_field_in(tenant, KUBE_CONTAINER, POD_ID_FIELD, &[pod_id])
                .await?;
        }

        let archived = self
            .archive
            .find_by_detail_field(tenant, KUBE_CONTAINER, POD_ID_FIELD, &[pod_id], 0)
            .await?;
        if !archived.is_empty() {
            warn!(rid, pod_id, count = archived.len(), "pod has archived containers");
        }
        containers.extend(archived.into_iter().map(|a| a.detail));
        Ok(containers)
    }

    fn dropped(
        &self,
        reason: &'static str,
    ) -> ParseOutcome {
        EVENTS_DROPPED.with_label_values(&[self.resource.as_str(), reason]).inc();
        ParseOutcome::Dropped(reason)
    }
}
