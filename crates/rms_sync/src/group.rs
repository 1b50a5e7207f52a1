//! Group service (spec.md §4.7): creation, the distinguished "Personal
//! Ledger" group, invites, member removal with key rotation, exit, fork.

use chrono::Utc;
use rms_crypto::{
    fingerprint_from_digest, generate_ed25519_keypair, generate_symmetric_key, sha256, Base64Bytes,
    Ed25519PublicKey, P256PublicKey,
};
use rms_proto::{
    Group, InviteScope, Mutation, Operation, PeerDirectory, PeerDirectoryPayload, SharedGroup,
    TargetType,
};
use rms_store::models::PendingInviteRow;
use serde_json::json;
use uuid::Uuid;

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::publish::enqueue_mutation;

/// Creates a group and emits its founding mutations: a `create` on
/// `group:<uuid>` and a `create` adding the local person as first member
/// (spec.md §4.7). Stores a fresh `GroupKey` locally.
pub async fn create_group(ctx: &SyncContext, name: &str, self_person_uuid: Uuid) -> Result<Group, SyncError> {
    let group = Group::new(name, self_person_uuid);
    finish_group_creation(ctx, &group, self_person_uuid).await?;
    Ok(group)
}

/// Every device creates exactly one self-only, un-exitable "Personal
/// Ledger" group during setup (spec.md §4.7).
pub async fn create_personal_ledger(ctx: &SyncContext, self_person_uuid: Uuid) -> Result<Group, SyncError> {
    let group = Group::new_personal_ledger(self_person_uuid);
    finish_group_creation(ctx, &group, self_person_uuid).await?;
    Ok(group)
}

async fn finish_group_creation(ctx: &SyncContext, group: &Group, self_person_uuid: Uuid) -> Result<(), SyncError> {
    let group_key = generate_symmetric_key();
    ctx.store.upsert_group_key(&group.uuid.to_string(), &group_key, Utc::now()).await?;

    sign_and_enqueue(
        ctx,
        format!("group:{}", group.uuid),
        TargetType::Group,
        Operation::Create { data: json!({"name": group.name, "members": [self_person_uuid]}) },
    )
    .await?;
    sign_and_enqueue(
        ctx,
        self_person_uuid.to_string(),
        TargetType::Person,
        Operation::Create { data: json!({"groupUuid": group.uuid}) },
    )
    .await?;
    Ok(())
}

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
    let mutation =
        Mutation::create_signed(id, target_uuid, target_type, operation, now, now, &identity.auth_public_key, &identity.auth_private_key)?;
    drop(guard);
    enqueue_mutation(ctx, &mutation).await?;
    Ok(mutation)
}

/// Inviter side of a group invite (spec.md §4.7: "same flow, group scope").
/// Uploads a temp-keyed handshake carrying the group name and a temp
/// symmetric key the invitee will use to seal its response.
pub async fn invite_to_group(ctx: &SyncContext, group: &Group) -> Result<(Uuid, rms_proto::GroupInvitePayload), SyncError> {
    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;

    let (temp_ipns_priv, temp_ipns_pub) = generate_ed25519_keypair();
    let temp_symmetric_key = generate_symmetric_key();

    let id = Uuid::new_v4();
    let now = Utc::now();
    let expires_at = now + chrono::Duration::milliseconds(ctx.config.sync.session_expiry_ms);
    let row = PendingInviteRow {
        id: id.to_string(),
        scope_json: serde_json::to_string(&InviteScope::GroupInvite { group_uuid: group.uuid, group_name: group.name.clone() })?,
        state: "created".to_string(),
        temp_ipns_public_key: temp_ipns_pub.to_bytes().to_vec(),
        temp_ipns_private_key: Some(temp_ipns_priv.to_bytes().to_vec()),
        temp_symmetric_key: Some(temp_symmetric_key.to_vec()),
        peer_ipns_public_key: None,
        peer_auth_public_key: None,
        peer_device_id: None,
        created_at: now,
        expires_at,
    };
    ctx.store.insert_pending_invite(&row).await?;

    let payload = rms_proto::GroupInvitePayload {
        version: 1,
        ipns_public_key: Base64Bytes::new(identity.ipns_public_key.to_bytes().to_vec()),
        auth_public_key: Base64Bytes::new(identity.auth_public_key.to_bytes().to_vec()),
        temp_ipns_private_key: Base64Bytes::new(temp_ipns_priv.to_bytes().to_vec()),
        temp_symmetric_key: Base64Bytes::new(temp_symmetric_key.to_vec()),
        group_name: group.name.clone(),
    };
    Ok((id, payload))
}

/// Invitee side: publishes an AES-GCM-encrypted response to the temp
/// name, sealed with the temp symmetric key.
pub async fn respond_to_group_invite(
    ctx: &SyncContext,
    invite: &rms_proto::GroupInvitePayload,
) -> Result<(), SyncError> {
    ensure_device_keys_checked(ctx).await?;
    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;

    let response = rms_proto::PairingResponse::new(
        Base64Bytes::new(identity.ipns_public_key.to_bytes().to_vec()),
        Base64Bytes::new(identity.auth_public_key.to_bytes().to_vec()),
        identity.device_id.clone(),
    );
    let plaintext = rms_crypto::to_canonical_bytes(&response)?;
    let key: [u8; 32] = invite.temp_symmetric_key.as_slice().try_into().map_err(|_| SyncError::Other("bad temp key".into()))?;
    let ciphertext = rms_crypto::aead::encrypt(&key, &plaintext, b"recordmoney-group-invite-v1")?;

    let temp_priv = rms_crypto::Ed25519PrivateKey::from_bytes(invite.temp_ipns_private_key.as_slice())?;
    let cid = ctx.blob_store.upload(&ciphertext, None).await?.cid;
    ctx.blob_store.publish_name(&temp_priv, &cid, 1).await?;
    Ok(())
}

async fn ensure_device_keys_checked(ctx: &SyncContext) -> Result<(), SyncError> {
    crate::device::ensure_device_keys(ctx).await
}

/// Inviter polls for the sealed response, decrypts it, fingerprints the
/// raw response bytes (`sha256(response)[0..5]`, spec.md §4.7 — distinct
/// from §4.6's key-concatenation fingerprint), and returns it for user
/// confirmation alongside the decoded peer identity.
pub async fn poll_group_invite_response(
    ctx: &SyncContext,
    invite_id: Uuid,
) -> Result<Option<([&'static str; 6], rms_proto::PairingResponse)>, SyncError> {
    let row = ctx
        .store
        .get_pending_invite(&invite_id.to_string())
        .await?
        .ok_or(SyncError::Other("no such invite".into()))?;
    if Utc::now() >= row.expires_at {
        return Err(SyncError::SessionExpired);
    }

    let temp_pub = Ed25519PublicKey::from_bytes(&row.temp_ipns_public_key)?;
    let Some(cid) = ctx.blob_store.resolve_name(&temp_pub).await? else {
        return Ok(None);
    };
    let ciphertext = ctx.blob_store.fetch(&cid).await?;
    let key: [u8; 32] = row
        .temp_symmetric_key
        .clone()
        .ok_or(SyncError::Other("missing temp symmetric key".into()))?
        .try_into()
        .map_err(|_| SyncError::Other("bad temp key".into()))?;
    let plaintext = rms_crypto::aead::decrypt(&key, &ciphertext, b"recordmoney-group-invite-v1")?;
    let response: rms_proto::PairingResponse = serde_json::from_slice(&plaintext)?;

    let digest = sha256(&ciphertext);
    let emojis = fingerprint_from_digest(&digest);

    ctx.store
        .update_pending_invite_state(
            &invite_id.to_string(),
            "responded",
            Some(response.ipns_public_key.as_slice()),
            Some(response.auth_public_key.as_slice()),
            Some(&response.device_id),
        )
        .await?;
    Ok(Some((emojis, response)))
}

/// On approval: adds the new member, emits a `person` mutation, and
/// shares the `GroupKey` by rewriting the group's `PeerDirectory` to add
/// the new member's entry (spec.md §4.7). `invite_id` identifies the
/// handshake from `invite_to_group`/`poll_group_invite_response`, whose
/// temp name is reused here (sequence 2, following the invitee's sequence-1
/// response) so the new member can resolve the directory the same way it
/// resolved the original invite.
pub async fn approve_group_invite(
    ctx: &SyncContext,
    group: &Group,
    invite_id: Uuid,
    new_member_person_uuid: Uuid,
    peer_auth_public: &P256PublicKey,
) -> Result<(), SyncError> {
    let invite = ctx
        .store
        .get_pending_invite(&invite_id.to_string())
        .await?
        .ok_or(SyncError::Other("no such invite".into()))?;
    let temp_ipns_private_key =
        invite.temp_ipns_private_key.clone().ok_or(SyncError::Other("invite has no temp ipns key".into()))?;

    let group_key_row = ctx
        .store
        .get_group_key(&group.uuid.to_string())
        .await?
        .ok_or(SyncError::Other("group key missing".into()))?;
    let group_key: [u8; 32] =
        group_key_row.group_key.try_into().map_err(|_| SyncError::Other("bad group key length".into()))?;

    sign_and_enqueue(
        ctx,
        new_member_person_uuid.to_string(),
        TargetType::Person,
        Operation::Create { data: json!({"groupUuid": group.uuid}) },
    )
    .await?;

    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;
    let sync_config = ctx.store.get_sync_config().await?.ok_or(SyncError::NotConfigured)?;
    let broadcast_key = sync_config.broadcast_key.ok_or(SyncError::NotConfigured)?;

    let payload = PeerDirectoryPayload {
        personal_key: None,
        broadcast_key: Base64Bytes::new(broadcast_key),
        shared_groups: vec![SharedGroup { group_uuid: group.uuid.to_string(), group_key: Base64Bytes::new(group_key.to_vec()) }],
    };
    let directory = PeerDirectory::build(&identity.auth_private_key, &[(peer_auth_public.clone(), payload)])?;
    let directory_bytes = rms_crypto::to_canonical_bytes(&directory)?;
    let directory_cid = ctx.blob_store.upload(&directory_bytes, None).await?.cid;
    drop(guard);

    ctx.store
        .upsert_cid_history(
            &format!("group-peer-directory:{}:{}", group.uuid, new_member_person_uuid),
            &directory_cid,
            "[]",
        )
        .await?;

    let temp_priv = rms_crypto::Ed25519PrivateKey::from_bytes(&temp_ipns_private_key)?;
    ctx.blob_store.publish_name(&temp_priv, &directory_cid, 2).await?;
    Ok(())
}

/// `removeMember`: emit a `delete` on the person UUID within the group,
/// rotate `GroupKey`, rewrite the `PeerDirectory` for the surviving
/// members under the new key. Rotation is the security guarantee removed
/// devices cannot read subsequent group data (spec.md §4.7).
///
/// `remaining_members` maps each surviving member's person UUID to their
/// device auth public key. Resolving person UUIDs to device public keys
/// is the caller's responsibility — this crate has no person-to-device
/// directory of its own (spec.md §1 places the domain schema out of
/// scope); a `LocalStore`-backed caller already owns that mapping.
pub async fn remove_member(
    ctx: &SyncContext,
    group: &Group,
    removed_person_uuid: Uuid,
    remaining_members: &[(Uuid, P256PublicKey)],
) -> Result<(), SyncError> {
    sign_and_enqueue(ctx, removed_person_uuid.to_string(), TargetType::Person, Operation::Delete).await?;

    let new_group_key = generate_symmetric_key();
    ctx.store.upsert_group_key(&group.uuid.to_string(), &new_group_key, Utc::now()).await?;
    tracing::info!(group = %group.uuid, "group key rotated after member removal");

    if remaining_members.is_empty() {
        return Ok(());
    }

    let slot = ctx.device_slot();
    let guard = slot.read().await;
    let identity = guard.as_ref().ok_or(SyncError::NotConfigured)?;
    let sync_config = ctx.store.get_sync_config().await?.ok_or(SyncError::NotConfigured)?;
    let broadcast_key = sync_config.broadcast_key.ok_or(SyncError::NotConfigured)?;

    let recipients: Vec<(P256PublicKey, PeerDirectoryPayload)> = remaining_members
        .iter()
        .map(|(_, public_key)| {
            let payload = PeerDirectoryPayload {
                personal_key: None,
                broadcast_key: Base64Bytes::new(broadcast_key.clone()),
                shared_groups: vec![SharedGroup {
                    group_uuid: group.uuid.to_string(),
                    group_key: Base64Bytes::new(new_group_key.to_vec()),
                }],
            };
            (public_key.clone(), payload)
        })
        .collect();

    let directory = PeerDirectory::build(&identity.auth_private_key, &recipients)?;
    let directory_bytes = rms_crypto::to_canonical_bytes(&directory)?;
    let directory_cid = ctx.blob_store.upload(&directory_bytes, None).await?.cid;
    drop(guard);

    ctx.store.upsert_cid_history(&format!("group-peer-directory:{}", group.uuid), &directory_cid, "[]").await?;
    Ok(())
}

/// `exitGroup`: emit `exit`; local data retained but no further
/// fetch/apply for this group (spec.md §4.7). The distinguished Personal
/// Ledger group cannot be exited.
pub async fn exit_group(ctx: &SyncContext, group: &Group) -> Result<(), SyncError> {
    if group.is_personal_ledger {
        return Err(SyncError::Other("the Personal Ledger group cannot be exited".into()));
    }
    sign_and_enqueue(ctx, format!("group:{}", group.uuid), TargetType::Group, Operation::Exit).await?;
    Ok(())
}

/// `forkGroup`: duplicate `group` under a new UUID and a fresh
/// `GroupKey`, excluding `excluded_members`, and enqueue the new group's
/// founding mutation. Replaying remaining members' existing mutations
/// into the forked group's chunk history (spec.md §4.7, §9 "design
/// note" — forked mutations keep their original signatures; only the
/// group association changes) needs a group-level manifest/chunk-index
/// publish pipeline this crate does not build: `GroupManifest` has no
/// encrypt/serialize/publish machinery the way `DeviceManifest` does
/// (see SPEC_FULL.md §8). Wiring that pipeline in is left to whatever
/// builds on this crate.
pub async fn fork_group(
    ctx: &SyncContext,
    group: &Group,
    excluded_members: &[Uuid],
) -> Result<Group, SyncError> {
    let remaining: Vec<Uuid> = group.members.iter().copied().filter(|m| !excluded_members.contains(m)).collect();
    let forked = Group { uuid: Uuid::new_v4(), name: format!("{} (forked)", group.name), members: remaining, is_personal_ledger: false };

    let new_group_key = generate_symmetric_key();
    ctx.store.upsert_group_key(&forked.uuid.to_string(), &new_group_key, Utc::now()).await?;

    sign_and_enqueue(
        ctx,
        format!("group:{}", forked.uuid),
        TargetType::Group,
        Operation::Create { data: json!({"name": forked.name, "members": forked.members, "forkedFrom": group.uuid}) },
    )
    .await?;

    Ok(forked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use rms_blobstore::InMemoryBlobStore;
    use std::path::PathBuf;
    use std::sync::Arc;

    async fn temp_ctx() -> SyncContext {
        let db_path = PathBuf::from(format!("/tmp/rms-sync-group-test-{}.db", Uuid::new_v4()));
        let store = rms_store::Store::open(&db_path).await.unwrap();
        let blob_store: Arc<dyn rms_blobstore::BlobStore> = Arc::new(InMemoryBlobStore::new());
        let ctx = SyncContext::new(store, blob_store, EngineConfig::new(vec!["http://localhost:9000".into()]));
        crate::device::ensure_device_keys(&ctx).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn personal_ledger_cannot_be_exited() {
        let ctx = temp_ctx().await;
        let person = Uuid::new_v4();
        let group = create_personal_ledger(&ctx, person).await.unwrap();
        assert!(group.is_personal_ledger);
        assert!(exit_group(&ctx, &group).await.is_err());
    }

    #[tokio::test]
    async fn create_group_stores_a_group_key() {
        let ctx = temp_ctx().await;
        let person = Uuid::new_v4();
        let group = create_group(&ctx, "Trip to Spain", person).await.unwrap();
        assert!(ctx.store.get_group_key(&group.uuid.to_string()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_member_rotates_group_key() {
        let ctx = temp_ctx().await;
        let person = Uuid::new_v4();
        let group = create_group(&ctx, "Trip", person).await.unwrap();
        let before = ctx.store.get_group_key(&group.uuid.to_string()).await.unwrap().unwrap().group_key;
        remove_member(&ctx, &group, Uuid::new_v4(), &[]).await.unwrap();
        let after = ctx.store.get_group_key(&group.uuid.to_string()).await.unwrap().unwrap().group_key;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn remove_member_rewrites_peer_directory_for_remaining_members() {
        let ctx = temp_ctx().await;
        let person = Uuid::new_v4();
        let group = create_group(&ctx, "Trip", person).await.unwrap();

        let (_, remaining_public_key) = rms_crypto::generate_p256_keypair();
        let remaining = vec![(Uuid::new_v4(), remaining_public_key)];
        remove_member(&ctx, &group, Uuid::new_v4(), &remaining).await.unwrap();

        let cid = ctx.store.get_cid_history(&format!("group-peer-directory:{}", group.uuid)).await.unwrap();
        assert!(cid.is_some(), "rewriting the directory for remaining members must record its CID");
    }
}
