//! One-shot legacy-data migration (spec.md §4.11): walks the legacy
//! `users`/`records`/`groups` tables and rewrites them into signed
//! `create` mutations addressed by fresh Person UUIDs.

use std::collections::HashMap;

use chrono::Utc;
use rms_proto::{Mutation, Operation, TargetType};
use serde_json::json;
use uuid::Uuid;

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::publish::enqueue_mutation;

async fn sign_and_enqueue(
    ctx: &SyncContext,
    target_uuid: String,
    target_type: TargetType,
    operation: Operation,
) -> Result<Mutation, SyncError> {
    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;
    let now = Utc::now();
    let id = ctx.store.next_mutation_id().await?;
    let mutation = Mutation::create_signed(
        id,
        target_uuid,
        target_type,
        operation,
        now,
        now,
        &identity.auth_public_key,
        &identity.auth_private_key,
    )?;
    drop(guard);
    enqueue_mutation(ctx, &mutation).await?;
    Ok(mutation)
}

#[derive(serde::Deserialize)]
struct LegacyShare {
    email: String,
    share: i64,
}

/// Resolves `email` to a Person UUID, creating and enqueueing a
/// placeholder Person (`isPlaceholder=true`) the first time an email is
/// referenced by a record or group that wasn't in the legacy users table
/// (spec.md §4.11: "unknown emails found in records become placeholder
/// Persons").
async fn resolve_or_create_placeholder(
    ctx: &SyncContext,
    persons: &mut HashMap<String, Uuid>,
    email: &str,
) -> Result<Uuid, SyncError> {
    if let Some(uuid) = persons.get(email) {
        return Ok(*uuid);
    }
    let uuid = Uuid::new_v4();
    sign_and_enqueue(
        ctx,
        uuid.to_string(),
        TargetType::Person,
        Operation::Create {
            data: json!({
                "email": email,
                "displayName": email,
                "isSelf": false,
                "isPlaceholder": true,
            }),
        },
    )
    .await?;
    persons.insert(email.to_string(), uuid);
    Ok(uuid)
}

/// `runMigration()` (spec.md §4.11). Idempotent: a second call after
/// `migrated=true` is a no-op. The self-identifying email must already be
/// set via `rms_store::Store::set_self_email` for `isSelf` to resolve; if
/// unset, no imported Person is marked self.
pub async fn run_migration(ctx: &SyncContext) -> Result<(), SyncError> {
    let sync_config = ctx.store.get_sync_config().await?;
    if sync_config.as_ref().map(|c| c.migrated).unwrap_or(false) {
        tracing::debug!("migration already ran, skipping");
        return Ok(());
    }
    let self_email = sync_config.and_then(|c| c.self_email);

    let mut persons: HashMap<String, Uuid> = HashMap::new();
    let mut self_person_uuid = String::new();

    for user in ctx.store.legacy_users().await? {
        let uuid = Uuid::new_v4();
        let is_self = self_email.as_deref() == Some(user.email.as_str());
        sign_and_enqueue(
            ctx,
            uuid.to_string(),
            TargetType::Person,
            Operation::Create {
                data: json!({
                    "email": user.email,
                    "displayName": user.display_name,
                    "isSelf": is_self,
                    "isPlaceholder": false,
                }),
            },
        )
        .await?;
        if is_self {
            self_person_uuid = uuid.to_string();
        }
        persons.insert(user.email, uuid);
    }

    for record in ctx.store.legacy_records().await? {
        let paid_by = resolve_or_create_placeholder(ctx, &mut persons, &record.paid_by_email).await?;
        let shares: Vec<LegacyShare> = serde_json::from_str(&record.paid_for_json)?;
        let mut paid_for = Vec::with_capacity(shares.len());
        for share in shares {
            let person_uuid = resolve_or_create_placeholder(ctx, &mut persons, &share.email).await?;
            paid_for.push(json!({"personUuid": person_uuid, "share": share.share}));
        }
        sign_and_enqueue(
            ctx,
            record.id,
            TargetType::Record,
            Operation::Create {
                data: json!({
                    "title": record.title,
                    "amount": record.amount,
                    "paidBy": paid_by,
                    "paidFor": paid_for,
                }),
            },
        )
        .await?;
    }

    for group in ctx.store.legacy_groups().await? {
        let emails: Vec<String> = serde_json::from_str(&group.member_emails_json)?;
        let mut members = Vec::with_capacity(emails.len());
        for email in &emails {
            members.push(resolve_or_create_placeholder(ctx, &mut persons, email).await?);
        }
        sign_and_enqueue(
            ctx,
            group.id,
            TargetType::Group,
            Operation::Create { data: json!({"name": group.name, "members": members}) },
        )
        .await?;
    }

    ctx.store.mark_migrated(&self_person_uuid, Utc::now()).await?;
    tracing::info!(imported_persons = persons.len(), "legacy migration complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use rms_blobstore::InMemoryBlobStore;
    use rms_store::models::{LegacyRecordRow, LegacyUserRow};
    use std::path::PathBuf;
    use std::sync::Arc;

    async fn temp_ctx() -> SyncContext {
        let db_path = PathBuf::from(format!("/tmp/rms-sync-migration-test-{}.db", Uuid::new_v4()));
        let store = rms_store::Store::open(&db_path).await.unwrap();
        let blob_store: Arc<dyn rms_blobstore::BlobStore> = Arc::new(InMemoryBlobStore::new());
        let ctx = SyncContext::new(store, blob_store, EngineConfig::new(vec!["http://localhost:9000".into()]));
        crate::device::ensure_device_keys(&ctx).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn migrates_users_and_records_into_mutations() {
        let ctx = temp_ctx().await;
        ctx.store.set_self_email("alice@example.com", Utc::now()).await.unwrap();
        ctx.store
            .insert_legacy_user(&LegacyUserRow { email: "alice@example.com".into(), display_name: "Alice".into() })
            .await
            .unwrap();
        ctx.store
            .insert_legacy_user(&LegacyUserRow { email: "bob@example.com".into(), display_name: "Bob".into() })
            .await
            .unwrap();
        ctx.store
            .insert_legacy_record(&LegacyRecordRow {
                id: "rec-1".into(),
                title: "Lunch".into(),
                amount: 100,
                paid_by_email: "alice@example.com".into(),
                paid_for_json: json!([
                    {"email": "alice@example.com", "share": 50},
                    {"email": "bob@example.com", "share": 50},
                ])
                .to_string(),
            })
            .await
            .unwrap();

        run_migration(&ctx).await.unwrap();

        let pending = ctx.store.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 3);

        let config = ctx.store.get_sync_config().await.unwrap().unwrap();
        assert!(config.migrated);
        assert!(!config.self_person_uuid.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_running_migration_is_a_no_op() {
        let ctx = temp_ctx().await;
        ctx.store
            .insert_legacy_user(&LegacyUserRow { email: "alice@example.com".into(), display_name: "Alice".into() })
            .await
            .unwrap();

        run_migration(&ctx).await.unwrap();
        let first_count = ctx.store.pending_mutations().await.unwrap().len();

        run_migration(&ctx).await.unwrap();
        let second_count = ctx.store.pending_mutations().await.unwrap().len();
        assert_eq!(first_count, second_count);
    }

    #[tokio::test]
    async fn unknown_emails_in_records_become_placeholders() {
        let ctx = temp_ctx().await;
        ctx.store
            .insert_legacy_record(&LegacyRecordRow {
                id: "rec-1".into(),
                title: "Taxi".into(),
                amount: 50,
                paid_by_email: "ghost@example.com".into(),
                paid_for_json: json!([{"email": "ghost@example.com", "share": 100}]).to_string(),
            })
            .await
            .unwrap();

        run_migration(&ctx).await.unwrap();
        // One placeholder Person + one Record mutation.
        assert_eq!(ctx.store.pending_mutations().await.unwrap().len(), 2);
    }
}
