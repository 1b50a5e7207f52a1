//! The signed, ordered, field-granular mutation log (spec.md §3, §4.3).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use rms_crypto::{canonical_digest, ecdsa_sign_p256, ecdsa_verify_p256, ByteField, P256PrivateKey, P256PublicKey};

use crate::error::ProtoError;

pub const PROTOCOL_VERSION: u32 = 1;

/// `signedAt` must be within this window of "now" for a freshly-received
/// mutation (spec.md §4.3, §6 `signatureValidityWindowMs`). Historical
/// mutations already present in a fetched chunk are checked for signature
/// validity only, never for freshness.
pub const SIGNATURE_VALIDITY_WINDOW: Duration = Duration::milliseconds(300_000);

/// Malformed-content threshold: signed further than this from "now" makes
/// content malformed regardless of context (spec.md §4.10).
pub const MALFORMED_TIMESTAMP_WINDOW: Duration = Duration::days(7);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Record,
    Person,
    Group,
    Device,
}

/// Array-typed fields compared by identifier key rather than deep equality
/// (spec.md §4.3 diff algorithm).
pub const ARRAY_TYPED_FIELDS: &[&str] = &["paidBy", "paidFor", "devices"];

/// Fields never diffed (spec.md §4.3: "skip excluded (`updatedAt`)").
pub const DIFF_EXCLUDED_FIELDS: &[&str] = &["updatedAt"];

fn identifier_key_for_field(field: &str) -> &'static str {
    match field {
        "devices" => "deviceId",
        _ => "personUuid",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayOpKind {
    Add,
    Remove,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalarChange {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayChange {
    pub field: String,
    pub op: ArrayOpKind,
    /// Value of the entry's identifier key (`personUuid` / `deviceId`).
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
}

/// One entry of an `update` mutation's `changes[]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldChange {
    Array(ArrayChange),
    Scalar(ScalarChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Field,
    Entity,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Create {
        data: Value,
    },
    Update {
        changes: Vec<FieldChange>,
    },
    Delete,
    Merge {
        #[serde(rename = "fromUuid")]
        from_uuid: String,
    },
    Exit,
    ResolveConflict {
        #[serde(rename = "conflictType")]
        conflict_type: ConflictKind,
        #[serde(rename = "winnerMutationUuid")]
        winner_mutation_uuid: Uuid,
        #[serde(rename = "voidedMutationUuids")]
        voided_mutation_uuids: Vec<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        summary: Option<String>,
    },
    ProposeUpgrade {
        #[serde(rename = "maxSupportedVersion")]
        max_supported_version: u32,
    },
}

/// Authoritative signed change record (spec.md §3 "Mutation").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub version: u32,
    pub uuid: Uuid,
    /// Per-device monotonic ID. `(authorDevicePublicKey, id)` is globally unique.
    pub id: u64,
    pub target_uuid: String,
    pub target_type: TargetType,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    pub signed_at: DateTime<Utc>,
    pub author_device_public_key: ByteField,
    pub signature: ByteField,
}

/// The fields a signature is computed over — everything except `signature`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningPayload<'a> {
    version: u32,
    uuid: Uuid,
    id: u64,
    target_uuid: &'a str,
    target_type: TargetType,
    operation: &'a Operation,
    timestamp: DateTime<Utc>,
    signed_at: DateTime<Utc>,
    author_device_public_key: &'a ByteField,
}

impl Mutation {
    /// Build and sign a new mutation. `timestamp` is the user-facing time;
    /// `signed_at` is set to `now`.
    pub fn create_signed(
        id: u64,
        target_uuid: impl Into<String>,
        target_type: TargetType,
        operation: Operation,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
        author_public_key: &P256PublicKey,
        author_private_key: &P256PrivateKey,
    ) -> Result<Self, ProtoError> {
        let mut mutation = Mutation {
            version: PROTOCOL_VERSION,
            uuid: Uuid::new_v4(),
            id,
            target_uuid: target_uuid.into(),
            target_type,
            operation,
            timestamp,
            signed_at: now,
            author_device_public_key: ByteField::new(author_public_key.to_bytes().to_vec()),
            signature: ByteField::default(),
        };
        mutation.signature = ByteField::new(mutation.compute_signature(author_private_key)?.to_vec());
        Ok(mutation)
    }

    fn signing_payload(&self) -> SigningPayload<'_> {
        SigningPayload {
            version: self.version,
            uuid: self.uuid,
            id: self.id,
            target_uuid: &self.target_uuid,
            target_type: self.target_type,
            operation: &self.operation,
            timestamp: self.timestamp,
            signed_at: self.signed_at,
            author_device_public_key: &self.author_device_public_key,
        }
    }

    fn compute_signature(&self, private_key: &P256PrivateKey) -> Result<[u8; 64], ProtoError> {
        let digest = canonical_digest(&self.signing_payload())?;
        Ok(ecdsa_sign_p256(private_key, &digest)?)
    }

    /// Verify the ECDSA signature against `author_device_public_key`.
    /// Authorization (that this key belongs to a known device ring member
    /// at publication time) is the caller's responsibility, per spec.md §4.3.
    pub fn verify_signature(&self) -> Result<(), ProtoError> {
        let public_key = P256PublicKey::from_bytes(self.author_device_public_key.as_slice())?;
        let digest = canonical_digest(&self.signing_payload())?;
        let sig: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| ProtoError::SignatureInvalid)?;
        ecdsa_verify_p256(&public_key, &digest, &sig).map_err(|_| ProtoError::SignatureInvalid)
    }

    /// Full verification of a freshly-received mutation: signature plus the
    /// `signedAt` freshness window. Mutations already at rest in a fetched
    /// chunk should call `verify_signature` only.
    pub fn verify_fresh(&self, now: DateTime<Utc>) -> Result<(), ProtoError> {
        self.verify_signature()?;
        let drift = (now - self.signed_at).num_milliseconds().abs();
        if drift > SIGNATURE_VALIDITY_WINDOW.num_milliseconds() {
            return Err(ProtoError::BadTimestamp(format!(
                "signedAt drift {drift}ms exceeds {}ms window",
                SIGNATURE_VALIDITY_WINDOW.num_milliseconds()
            )));
        }
        Ok(())
    }

    /// spec.md §4.10: content older/newer than 7 days from `now` is malformed.
    pub fn is_malformed_by_age(&self, now: DateTime<Utc>) -> bool {
        (now - self.signed_at).num_milliseconds().abs() > MALFORMED_TIMESTAMP_WINDOW.num_milliseconds()
    }
}

// ── Diff / apply ──────────────────────────────────────────────────────────────

fn deep_eq(a: &Value, b: &Value) -> bool {
    a == b
}

fn array_entries(value: &Value) -> Vec<Map<String, Value>> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_object().cloned())
                .collect()
        })
        .unwrap_or_default()
}

fn entry_key<'a>(entry: &'a Map<String, Value>, id_key: &str) -> Option<&'a str> {
    entry.get(id_key).and_then(Value::as_str)
}

/// Diff two object states into `changes[]`, per spec.md §4.3: walk the
/// union of keys, skip `DIFF_EXCLUDED_FIELDS`, treat `ARRAY_TYPED_FIELDS`
/// specially (compare by identifier key, emit add/remove/update), and
/// scalar-compare everything else. Unchanged fields are omitted.
pub fn diff_fields(old: &Value, new: &Value) -> Vec<FieldChange> {
    let empty = Map::new();
    let old_obj = old.as_object().unwrap_or(&empty);
    let new_obj = new.as_object().unwrap_or(&empty);

    let mut keys: Vec<&String> = old_obj.keys().chain(new_obj.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut changes = Vec::new();
    for key in keys {
        if DIFF_EXCLUDED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let old_val = old_obj.get(key);
        let new_val = new_obj.get(key);

        if ARRAY_TYPED_FIELDS.contains(&key.as_str()) {
            let id_key = identifier_key_for_field(key);
            let old_entries = old_val.map(array_entries).unwrap_or_default();
            let new_entries = new_val.map(array_entries).unwrap_or_default();

            for new_entry in &new_entries {
                let Some(k) = entry_key(new_entry, id_key) else { continue };
                match old_entries.iter().find(|e| entry_key(e, id_key) == Some(k)) {
                    None => changes.push(FieldChange::Array(ArrayChange {
                        field: key.clone(),
                        op: ArrayOpKind::Add,
                        key: k.to_string(),
                        value: Some(Value::Object(new_entry.clone())),
                    })),
                    Some(old_entry) if old_entry != new_entry => {
                        changes.push(FieldChange::Array(ArrayChange {
                            field: key.clone(),
                            op: ArrayOpKind::Update,
                            key: k.to_string(),
                            value: Some(Value::Object(new_entry.clone())),
                        }))
                    }
                    Some(_) => {}
                }
            }
            for old_entry in &old_entries {
                let Some(k) = entry_key(old_entry, id_key) else { continue };
                if !new_entries.iter().any(|e| entry_key(e, id_key) == Some(k)) {
                    changes.push(FieldChange::Array(ArrayChange {
                        field: key.clone(),
                        op: ArrayOpKind::Remove,
                        key: k.to_string(),
                        value: None,
                    }));
                }
            }
            continue;
        }

        match (old_val, new_val) {
            (Some(o), Some(n)) if !deep_eq(o, n) => changes.push(FieldChange::Scalar(ScalarChange {
                field: key.clone(),
                old: o.clone(),
                new: n.clone(),
            })),
            (None, Some(n)) => changes.push(FieldChange::Scalar(ScalarChange {
                field: key.clone(),
                old: Value::Null,
                new: n.clone(),
            })),
            (Some(o), None) => changes.push(FieldChange::Scalar(ScalarChange {
                field: key.clone(),
                old: o.clone(),
                new: Value::Null,
            })),
            _ => {}
        }
    }
    changes
}

/// Pure function: apply `changes` to `obj`, returning a new object. Never
/// mutates `obj` (spec.md §4.3 "Application").
pub fn apply_field_changes(obj: &Value, changes: &[FieldChange]) -> Result<Value, ProtoError> {
    let mut out = obj
        .as_object()
        .cloned()
        .ok_or_else(|| ProtoError::MalformedMutation("apply target is not an object".into()))?;

    for change in changes {
        match change {
            FieldChange::Scalar(sc) => {
                if sc.new.is_null() {
                    out.remove(&sc.field);
                } else {
                    out.insert(sc.field.clone(), sc.new.clone());
                }
            }
            FieldChange::Array(ac) => {
                let id_key = identifier_key_for_field(&ac.field);
                let mut entries = out
                    .get(&ac.field)
                    .map(array_entries)
                    .unwrap_or_default();

                match ac.op {
                    ArrayOpKind::Add => {
                        if let Some(value) = &ac.value {
                            if let Some(entry) = value.as_object() {
                                if !entries.iter().any(|e| entry_key(e, id_key) == Some(ac.key.as_str())) {
                                    entries.push(entry.clone());
                                }
                            }
                        }
                    }
                    ArrayOpKind::Remove => {
                        entries.retain(|e| entry_key(e, id_key) != Some(ac.key.as_str()));
                    }
                    ArrayOpKind::Update => {
                        if let Some(value) = &ac.value {
                            if let Some(patch) = value.as_object() {
                                if let Some(entry) =
                                    entries.iter_mut().find(|e| entry_key(e, id_key) == Some(ac.key.as_str()))
                                {
                                    for (k, v) in patch {
                                        entry.insert(k.clone(), v.clone());
                                    }
                                }
                            }
                        }
                    }
                }

                let arr: Vec<Value> = entries.into_iter().map(Value::Object).collect();
                out.insert(ac.field.clone(), Value::Array(arr));
            }
        }
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rms_crypto::generate_p256_keypair;
    use serde_json::json;

    fn signed_mutation(id: u64, target_uuid: &str) -> (Mutation, rms_crypto::P256PrivateKey, rms_crypto::P256PublicKey) {
        let (private, public) = generate_p256_keypair();
        let now = Utc::now();
        let mutation = Mutation::create_signed(
            id,
            target_uuid,
            TargetType::Record,
            Operation::Create { data: json!({"title": "Lunch", "amount": 100}) },
            now,
            now,
            &public,
            &private,
        )
        .unwrap();
        (mutation, private, public)
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let (mutation, _, _) = signed_mutation(1, "r-1");
        assert!(mutation.verify_signature().is_ok());
    }

    #[test]
    fn tampering_invalidates_signature() {
        let (mut mutation, _, _) = signed_mutation(1, "r-1");
        mutation.target_uuid = "r-2".into();
        assert!(mutation.verify_signature().is_err());
    }

    #[test]
    fn freshness_window_boundary() {
        let (private, public) = generate_p256_keypair();
        let signed_at = Utc::now();
        let mutation = Mutation::create_signed(
            1,
            "r-1",
            TargetType::Record,
            Operation::Delete,
            signed_at,
            signed_at,
            &public,
            &private,
        )
        .unwrap();

        let exactly_five_min = signed_at + Duration::milliseconds(300_000);
        assert!(mutation.verify_fresh(exactly_five_min).is_ok());

        let one_ms_over = signed_at + Duration::milliseconds(300_001);
        assert!(mutation.verify_fresh(one_ms_over).is_err());
    }

    #[test]
    fn diff_detects_scalar_change() {
        let old = json!({"amount": 100, "title": "Lunch"});
        let new = json!({"amount": 200, "title": "Lunch"});
        let changes = diff_fields(&old, &new);
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            FieldChange::Scalar(sc) => {
                assert_eq!(sc.field, "amount");
                assert_eq!(sc.old, json!(100));
                assert_eq!(sc.new, json!(200));
            }
            _ => panic!("expected scalar change"),
        }
    }

    #[test]
    fn diff_detects_array_add_remove_update() {
        let old = json!({
            "paidFor": [
                {"personUuid": "a", "share": 50},
                {"personUuid": "b", "share": 50},
            ]
        });
        let new = json!({
            "paidFor": [
                {"personUuid": "a", "share": 30},
                {"personUuid": "c", "share": 70},
            ]
        });
        let changes = diff_fields(&old, &new);
        assert_eq!(changes.len(), 3);
        let mut ops: Vec<ArrayOpKind> = changes
            .iter()
            .map(|c| match c {
                FieldChange::Array(ac) => ac.op,
                _ => panic!("expected array change"),
            })
            .collect();
        ops.sort_by_key(|o| format!("{o:?}"));
        assert_eq!(ops, vec![ArrayOpKind::Add, ArrayOpKind::Remove, ArrayOpKind::Update]);
    }

    #[test]
    fn apply_then_inverse_round_trips() {
        let old = json!({"amount": 100, "title": "Lunch"});
        let new = json!({"amount": 200, "title": "Lunch"});
        let forward = diff_fields(&old, &new);
        let applied = apply_field_changes(&old, &forward).unwrap();
        assert_eq!(applied, new);

        let backward = diff_fields(&new, &old);
        let reverted = apply_field_changes(&applied, &backward).unwrap();
        assert_eq!(reverted, old);
    }

    #[test]
    fn excluded_field_never_diffed() {
        let old = json!({"amount": 100, "updatedAt": "2024-01-01"});
        let new = json!({"amount": 100, "updatedAt": "2024-06-01"});
        assert!(diff_fields(&old, &new).is_empty());
    }

    #[test]
    fn canonical_mutation_serializes_tagged_byte_fields() {
        let (mutation, _, _) = signed_mutation(1, "r-1");
        let bytes = rms_crypto::to_canonical_bytes(&mutation).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"__type\":\"Uint8Array\""));
    }
}
