use std::collections::BTreeSet;

use serde_json::Value as JsonValue;

use genflow_core::TenantId;

use crate::store::{Condition, Document, Filter, Operation};

/// Field carrying the owning tenant on every tenant-owned document.
pub const TENANT_FIELD: &str = "tenantId";

/// Models whose documents belong to exactly one tenant.
pub const TENANT_OWNED_MODELS: [&str; 5] = ["Job", "Dataset", "Influencer", "User", "LoraConfig"];

/// Tenant-isolation rules for persistence operations.
///
/// For a scoped model and a tenant in context:
///
/// - list-style reads (`FindMany`, `FindFirst`, `Count`) and all writes by
///   filter (`Update*`, `Delete*`) get `tenantId = <tenant>` forced into the
///   filter, replacing any caller-supplied `tenantId`
/// - `FindUnique` gets the tenant only when the caller did not name one
/// - `Create*` payloads get `tenantId` overwritten
/// - `Upsert` combines the filter and create rules
///
/// Update payloads that try to move a record to another tenant are pinned back
/// to the context tenant. Without a tenant, or for unscoped models, the
/// operation passes through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    models: BTreeSet<String>,
}

impl Default for TenantScope {
    fn default() -> Self {
        Self::new(TENANT_OWNED_MODELS)
    }
}

impl TenantScope {
    pub fn new<I, M>(models: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.insert(model.into());
        self
    }

    pub fn is_scoped(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    pub fn apply(&self, model: &str, tenant: Option<TenantId>, op: Operation) -> Operation {
        let Some(tenant) = tenant else {
            return op;
        };
        if !self.is_scoped(model) {
            return op;
        }

        tracing::trace!(model, op = op.kind().as_str(), tenant_id = %tenant, "scoping operation");
        let tenant = JsonValue::String(tenant.to_string());

        match op {
            Operation::FindMany {
                filter,
                order,
                pagination,
            } => Operation::FindMany {
                filter: force(filter, &tenant),
                order,
                pagination,
            },
            Operation::FindFirst { filter, order } => Operation::FindFirst {
                filter: force(filter, &tenant),
                order,
            },
            Operation::Count { filter } => Operation::Count {
                filter: force(filter, &tenant),
            },
            Operation::FindUnique { mut filter } => {
                if !filter.contains(TENANT_FIELD) {
                    filter.insert(TENANT_FIELD, Condition::Eq(tenant));
                }
                Operation::FindUnique { filter }
            }
            Operation::Create { data } => Operation::Create {
                data: stamp(data, &tenant),
            },
            Operation::CreateMany { data } => Operation::CreateMany {
                data: data.into_iter().map(|d| stamp(d, &tenant)).collect(),
            },
            Operation::Update { filter, data } => Operation::Update {
                filter: force(filter, &tenant),
                data: pin(data, &tenant),
            },
            Operation::UpdateMany { filter, data } => Operation::UpdateMany {
                filter: force(filter, &tenant),
                data: pin(data, &tenant),
            },
            Operation::Upsert {
                filter,
                create,
                update,
            } => Operation::Upsert {
                filter: force(filter, &tenant),
                create: stamp(create, &tenant),
                update: pin(update, &tenant),
            },
            Operation::Delete { filter } => Operation::Delete {
                filter: force(filter, &tenant),
            },
            Operation::DeleteMany { filter } => Operation::DeleteMany {
                filter: force(filter, &tenant),
            },
        }
    }
}

fn force(mut filter: Filter, tenant: &JsonValue) -> Filter {
    filter.insert(TENANT_FIELD, Condition::Eq(tenant.clone()));
    filter
}

fn stamp(mut data: Document, tenant: &JsonValue) -> Document {
    data.insert(TENANT_FIELD.to_string(), tenant.clone());
    data
}

fn pin(mut data: Document, tenant: &JsonValue) -> Document {
    if data.contains_key(TENANT_FIELD) {
        data.insert(TENANT_FIELD.to_string(), tenant.clone());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: JsonValue) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn tenant_eq(t: TenantId) -> Condition {
        Condition::Eq(json!(t.to_string()))
    }

    #[test]
    fn list_reads_override_caller_tenant_but_keep_other_constraints() {
        let scope = TenantScope::default();
        let (a, b) = (TenantId::new(), TenantId::new());
        let op = Operation::FindMany {
            filter: Filter::new().eq("tenantId", b.to_string()).eq("status", "pending"),
            order: None,
            pagination: None,
        };

        let Operation::FindMany { filter, .. } = scope.apply("Job", Some(a), op) else {
            panic!("kind changed");
        };
        assert_eq!(filter.get(TENANT_FIELD), Some(&tenant_eq(a)));
        assert_eq!(filter.get("status"), Some(&Condition::Eq(json!("pending"))));
    }

    #[test]
    fn count_and_find_first_are_scoped() {
        let scope = TenantScope::default();
        let t = TenantId::new();

        let Operation::Count { filter } = scope.apply("Dataset", Some(t), Operation::Count { filter: Filter::new() }) else {
            panic!("kind changed");
        };
        assert_eq!(filter.get(TENANT_FIELD), Some(&tenant_eq(t)));

        let op = Operation::FindFirst { filter: Filter::new(), order: None };
        let Operation::FindFirst { filter, .. } = scope.apply("User", Some(t), op) else {
            panic!("kind changed");
        };
        assert_eq!(filter.get(TENANT_FIELD), Some(&tenant_eq(t)));
    }

    #[test]
    fn find_unique_keeps_explicit_caller_tenant() {
        let scope = TenantScope::default();
        let (ctx, explicit) = (TenantId::new(), TenantId::new());

        let op = Operation::FindUnique {
            filter: Filter::new().eq("id", "j1").eq("tenantId", explicit.to_string()),
        };
        let Operation::FindUnique { filter } = scope.apply("Job", Some(ctx), op) else {
            panic!("kind changed");
        };
        assert_eq!(filter.get(TENANT_FIELD), Some(&tenant_eq(explicit)));

        let op = Operation::FindUnique { filter: Filter::new().eq("id", "j1") };
        let Operation::FindUnique { filter } = scope.apply("Job", Some(ctx), op) else {
            panic!("kind changed");
        };
        assert_eq!(filter.get(TENANT_FIELD), Some(&tenant_eq(ctx)));
    }

    #[test]
    fn creates_overwrite_payload_tenant() {
        let scope = TenantScope::default();
        let (t, other) = (TenantId::new(), TenantId::new());

        let op = Operation::CreateMany {
            data: vec![
                doc(json!({"id": "1", "tenantId": other.to_string()})),
                doc(json!({"id": "2"})),
            ],
        };
        let Operation::CreateMany { data } = scope.apply("Influencer", Some(t), op) else {
            panic!("kind changed");
        };
        for d in data {
            assert_eq!(d[TENANT_FIELD], json!(t.to_string()));
        }
    }

    #[test]
    fn writes_by_filter_are_confined_and_cannot_move_records() {
        let scope = TenantScope::default();
        let (t, other) = (TenantId::new(), TenantId::new());

        let op = Operation::Update {
            filter: Filter::new().eq("id", "j1"),
            data: doc(json!({"status": "running", "tenantId": other.to_string()})),
        };
        let Operation::Update { filter, data } = scope.apply("Job", Some(t), op) else {
            panic!("kind changed");
        };
        assert_eq!(filter.get(TENANT_FIELD), Some(&tenant_eq(t)));
        assert_eq!(data[TENANT_FIELD], json!(t.to_string()));

        let op = Operation::DeleteMany { filter: Filter::new() };
        let Operation::DeleteMany { filter } = scope.apply("LoraConfig", Some(t), op) else {
            panic!("kind changed");
        };
        assert_eq!(filter.get(TENANT_FIELD), Some(&tenant_eq(t)));
    }

    #[test]
    fn upsert_scopes_filter_and_create_payload() {
        let scope = TenantScope::default();
        let t = TenantId::new();
        let op = Operation::Upsert {
            filter: Filter::new().eq("id", "u1"),
            create: doc(json!({"id": "u1"})),
            update: doc(json!({"email": "a@b.c"})),
        };
        let Operation::Upsert { filter, create, update } = scope.apply("User", Some(t), op) else {
            panic!("kind changed");
        };
        assert_eq!(filter.get(TENANT_FIELD), Some(&tenant_eq(t)));
        assert_eq!(create[TENANT_FIELD], json!(t.to_string()));
        assert!(!update.contains_key(TENANT_FIELD));
    }

    #[test]
    fn passthrough_without_tenant_or_for_unscoped_models() {
        let scope = TenantScope::default();
        let op = Operation::Count { filter: Filter::new() };

        assert_eq!(scope.apply("Job", None, op.clone()), op);
        assert_eq!(scope.apply("PipelineExecution", Some(TenantId::new()), op.clone()), op);
        assert_eq!(scope.apply("Tenant", Some(TenantId::new()), op.clone()), op);
    }

    #[test]
    fn allow_list_is_extensible() {
        let scope = TenantScope::default().with_model("Asset");
        assert!(scope.is_scoped("Asset"));
        assert!(scope.is_scoped("Job"));
        assert!(!scope.is_scoped("Tenant"));
    }
}
