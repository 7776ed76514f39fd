//! Container layer (C4 — spec §4.4).
//!
//! A container is three optional slices (access, main, append) plus
//! the key-derivation chain that relates them: `full_key` is random
//! at creation; `list_key = KD(full_key, KD_LIST)`; `append_key =
//! KD(list_key, KD_APPEND)`. Whoever holds a higher key can always
//! derive the lower ones, so `Container` stores only the highest key
//! it has been given and derives the rest on demand.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::block::Block;
use crate::config::Config;
use crate::envelope;
use crate::error::{Error, Result};
use crate::group::GroupParams;
use crate::kd;
use crate::magic::{self, AccessType};
use crate::packing::{self, Value};
use crate::slice::{self, Slice, SliceLayout};
use crate::stream::{self, BlockCipherStream};

#[derive(Clone, Debug)]
pub struct Entry {
    pub key: Vec<u8>,
    pub note: Vec<u8>,
    pub secret: Vec<u8>,
}

pub struct Container {
    pub full_key: Option<Vec<u8>>,
    pub list_key_only: Option<Vec<u8>>,
    pub append_key_only: Option<Vec<u8>>,
    pub main_slice: Option<Slice>,
    pub append_slice: Option<Slice>,
    pub envelope_pubkey: Option<[u8; 32]>,
    pub envelope_privkey: Option<[u8; 32]>,
    pub entries: Vec<Option<Entry>>,
    pub append_queue: Vec<Vec<u8>>,
    touched: bool,
}

impl Container {
    pub fn empty() -> Container {
        Container {
            full_key: None,
            list_key_only: None,
            append_key_only: None,
            main_slice: None,
            append_slice: None,
            envelope_pubkey: None,
            envelope_privkey: None,
            entries: Vec::new(),
            append_queue: Vec::new(),
            touched: false,
        }
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }

    pub fn access_level(&self) -> Option<AccessType> {
        if self.full_key.is_some() {
            Some(AccessType::Full)
        } else if self.list_key_only.is_some() {
            Some(AccessType::List)
        } else if self.append_key_only.is_some() {
            Some(AccessType::Append)
        } else {
            None
        }
    }

    pub fn list_key(&self) -> Option<Vec<u8>> {
        self.full_key
            .as_deref()
            .map(derive_list_key)
            .or_else(|| self.list_key_only.clone())
    }

    pub fn append_key(&self) -> Option<Vec<u8>> {
        self.full_key
            .as_deref()
            .map(|fk| derive_append_key(&derive_list_key(fk)))
            .or_else(|| self.list_key_only.as_deref().map(derive_append_key))
            .or_else(|| self.append_key_only.clone())
    }

    fn merge_grant(&mut self, grant: &AccessGrant) {
        match grant.access_type {
            AccessType::Full => self.full_key = Some(grant.key.clone()),
            AccessType::List => {
                if self.full_key.is_none() {
                    self.list_key_only = Some(grant.key.clone());
                }
            }
            AccessType::Append => {
                if self.full_key.is_none() && self.list_key_only.is_none() {
                    self.append_key_only = Some(grant.key.clone());
                }
            }
        }
    }

    pub fn list(&self) -> Vec<&Entry> {
        self.entries.iter().filter_map(|e| e.as_ref()).collect()
    }

    pub fn get(&self, key: &[u8]) -> Vec<&Entry> {
        self.list().into_iter().filter(|e| e.key == key).collect()
    }

    /// Requires `full_key`.
    pub fn add(&mut self, key: Vec<u8>, note: Vec<u8>, secret: Vec<u8>) -> Result<()> {
        if self.full_key.is_none() {
            return Err(Error::MissingKey);
        }
        self.entries.push(Some(Entry { key, note, secret }));
        self.touched = true;
        Ok(())
    }

    /// Marks every entry matching `key` as deleted in place; they are
    /// compacted out on the next [`save`]. Requires `full_key`.
    pub fn remove(&mut self, key: &[u8]) -> Result<usize> {
        if self.full_key.is_none() {
            return Err(Error::MissingKey);
        }
        let mut removed = 0;
        for slot in self.entries.iter_mut() {
            if slot.as_ref().map(|e| e.key == key).unwrap_or(false) {
                *slot = None;
                removed += 1;
            }
        }
        self.touched = true;
        Ok(removed)
    }

    /// Appends an entry via the append-only path: a holder of only
    /// `append_key` cannot decrypt `secrets_ct`, so it seals the new
    /// entry to the envelope public key instead.
    pub fn append(&mut self, key: Vec<u8>, note: Vec<u8>, secret: Vec<u8>) -> Result<()> {
        let pubkey_bytes = self.envelope_pubkey.ok_or(Error::MissingKey)?;
        if self.append_key().is_none() {
            return Err(Error::MissingKey);
        }
        let packed = packing::encode(&Value::List(vec![
            Value::bytes(key),
            Value::bytes(note),
            Value::bytes(secret),
        ]));
        let pubkey = PublicKey::from(pubkey_bytes);
        let sealed = envelope::seal(&packed, &pubkey)?;
        self.append_queue.push(sealed);
        self.touched = true;
        Ok(())
    }

    /// Decrypts every queued append-slice entry and moves it into the
    /// main entry list. A no-op if `full_key` (and so
    /// `envelope_privkey`) is not held, or the queue is empty. Returns
    /// the keys that were moved, for callers that want to notify a
    /// user their append-only collaborators added something.
    pub fn apply_move_on_open(&mut self) -> Result<Vec<Vec<u8>>> {
        if self.append_queue.is_empty() {
            return Ok(Vec::new());
        }
        let privkey_bytes = match self.envelope_privkey {
            Some(k) => k,
            None => return Ok(Vec::new()),
        };
        let privkey = StaticSecret::from(privkey_bytes);
        let mut moved = Vec::new();
        for ct in std::mem::take(&mut self.append_queue) {
            let plain = envelope::open(&ct, &privkey)?;
            let value = packing::decode_all(&plain)?;
            let fields = value.as_list()?;
            if fields.len() != 3 {
                return Err(Error::SafeFormat("appended entry must have 3 fields".into()));
            }
            let key = fields[0].as_bytes()?.to_vec();
            let note = fields[1].as_bytes()?.to_vec();
            let secret = fields[2].as_bytes()?.to_vec();
            moved.push(key.clone());
            self.entries.push(Some(Entry { key, note, secret }));
        }
        self.touched = true;
        Ok(moved)
    }
}

/// Wipes the key material a `Container` holds when it goes out of
/// scope, the same zero-on-drop discipline crypto key types in this
/// codebase follow elsewhere, minus the `mlock` half (a password-safe
/// process isn't expected to defend against its own memory being
/// swapped to disk the way a long-lived signing key is).
impl Drop for Container {
    fn drop(&mut self) {
        if let Some(k) = &mut self.full_key {
            k.zeroize();
        }
        if let Some(k) = &mut self.list_key_only {
            k.zeroize();
        }
        if let Some(k) = &mut self.append_key_only {
            k.zeroize();
        }
        if let Some(k) = &mut self.envelope_privkey {
            k.zeroize();
        }
    }
}

pub fn derive_list_key(full_key: &[u8]) -> Vec<u8> {
    kd::derive(&[full_key, &magic::KD_LIST], kd::NATIVE_LEN)
}

pub fn derive_append_key(list_key: &[u8]) -> Vec<u8> {
    kd::derive(&[list_key, &magic::KD_APPEND], kd::NATIVE_LEN)
}

/// Combines a password with optional keyfile-style additional keys:
/// `KD([password, sorted(keys)...])`. Sorting makes key order
/// irrelevant to the caller (spec §4.5).
pub fn compose_password(password: &[u8], additional_keys: &[&[u8]]) -> Vec<u8> {
    if additional_keys.is_empty() {
        return password.to_vec();
    }
    let mut sorted = additional_keys.to_vec();
    sorted.sort_unstable();
    let mut inputs = Vec::with_capacity(1 + sorted.len());
    inputs.push(password);
    inputs.extend(sorted);
    kd::derive(&inputs, kd::NATIVE_LEN)
}

#[derive(Clone, Debug)]
pub struct AccessGrant {
    pub access_type: AccessType,
    pub key: Vec<u8>,
    pub first_index: u64,
    /// The access slice itself (spec §9's "not reachable from any
    /// opened access slice" free-set rule needs these indices too,
    /// not just the main/append slice they point at).
    pub access_slice: Slice,
}

fn encode_access_payload(access_type: AccessType, key: &[u8], first_index: u64) -> Vec<u8> {
    let value = Value::List(vec![
        Value::bytes(magic::AS_MAGIC.to_vec()),
        Value::u64(access_type as u8 as u64),
        Value::bytes(key.to_vec()),
        Value::u64(first_index),
    ]);
    // Access slices must keep constant structural shape (spec §9): never deflate.
    packing::encode_framed_uncompressed(&value)
}

fn decode_access_payload(payload: &[u8], access_slice: Slice) -> Result<AccessGrant> {
    let value = packing::decode_framed(payload)?;
    let items = value.as_list()?;
    if items.len() != 4 {
        return Err(Error::SafeFormat("access tuple must have 4 fields".into()));
    }
    if items[0].as_bytes()? != magic::AS_MAGIC {
        return Err(Error::SafeFormat("wrong access-slice magic".into()));
    }
    let access_type = AccessType::from_u8(items[1].as_u64()? as u8)
        .ok_or_else(|| Error::SafeFormat("unknown access-slice type".into()))?;
    let key = items[2].as_bytes()?.to_vec();
    let first_index = items[3].as_u64()?;
    Ok(AccessGrant {
        access_type,
        key,
        first_index,
        access_slice,
    })
}

/// Scans every block for an access slice opened by `access_key`.
pub fn find_access_grants(
    group: &GroupParams,
    blocks: &[Block],
    layout: SliceLayout,
    access_key: &[u8],
) -> Vec<AccessGrant> {
    let mut grants = Vec::new();
    for (access_slice, payload) in slice::find(group, blocks, access_key, layout) {
        match decode_access_payload(&payload, access_slice) {
            Ok(grant) => grants.push(grant),
            Err(e) => log::debug!("access slice candidate failed to decode: {e}"),
        }
    }
    grants
}

struct DecodedMain {
    append_index: Option<u64>,
    entry_headers: Vec<(Vec<u8>, Vec<u8>)>,
    iv: Vec<u8>,
    secrets_ct: Vec<u8>,
}

fn encode_main(append_first_index: Option<u64>, entries: &[Entry], iv: &[u8], secrets_ct: &[u8]) -> Vec<u8> {
    let append_value = match append_first_index {
        Some(i) => Value::u64(i),
        None => Value::bytes(Vec::new()),
    };
    let entries_value = Value::List(
        entries
            .iter()
            .map(|e| Value::List(vec![Value::bytes(e.key.clone()), Value::bytes(e.note.clone())]))
            .collect(),
    );
    let value = Value::List(vec![
        Value::bytes(magic::MAIN_SLICE_MAGIC.to_vec()),
        append_value,
        entries_value,
        Value::bytes(iv.to_vec()),
        Value::bytes(secrets_ct.to_vec()),
    ]);
    packing::encode_framed(&value)
}

fn decode_main(payload: &[u8]) -> Result<DecodedMain> {
    let value = packing::decode_framed(payload)?;
    let items = value.as_list()?;
    if items.len() != 5 {
        return Err(Error::SafeFormat("main tuple must have 5 fields".into()));
    }
    if items[0].as_bytes()? != magic::MAIN_SLICE_MAGIC {
        return Err(Error::SafeFormat("wrong main-slice magic".into()));
    }
    let append_index = match &items[1] {
        Value::Bytes(b) if b.is_empty() => None,
        other => Some(other.as_u64()?),
    };
    let entry_headers = items[2]
        .as_list()?
        .iter()
        .map(|pair| {
            let fields = pair.as_list()?;
            if fields.len() != 2 {
                return Err(Error::SafeFormat("entry header must have 2 fields".into()));
            }
            Ok((fields[0].as_bytes()?.to_vec(), fields[1].as_bytes()?.to_vec()))
        })
        .collect::<Result<Vec<_>>>()?;
    let iv = items[3].as_bytes()?.to_vec();
    let secrets_ct = items[4].as_bytes()?.to_vec();
    Ok(DecodedMain {
        append_index,
        entry_headers,
        iv,
        secrets_ct,
    })
}

fn encode_append(envelope_pubkey: &[u8; 32], ciphertexts: &[Vec<u8>]) -> Vec<u8> {
    let value = Value::List(vec![
        Value::bytes(magic::APPEND_SLICE_MAGIC.to_vec()),
        Value::bytes(envelope_pubkey.to_vec()),
        Value::List(ciphertexts.iter().map(|c| Value::bytes(c.clone())).collect()),
    ]);
    packing::encode_framed(&value)
}

fn decode_append(payload: &[u8]) -> Result<([u8; 32], Vec<Vec<u8>>)> {
    let value = packing::decode_framed(payload)?;
    let items = value.as_list()?;
    if items.len() != 3 {
        return Err(Error::SafeFormat("append tuple must have 3 fields".into()));
    }
    if items[0].as_bytes()? != magic::APPEND_SLICE_MAGIC {
        return Err(Error::SafeFormat("wrong append-slice magic".into()));
    }
    let pub_bytes = items[1].as_bytes()?;
    if pub_bytes.len() != envelope::PUBLIC_KEY_SIZE {
        return Err(Error::SafeFormat("bad envelope public key length".into()));
    }
    let mut buf = [0u8; 32];
    buf.copy_from_slice(pub_bytes);
    let ciphertexts = items[2]
        .as_list()?
        .iter()
        .map(|v| v.as_bytes().map(|b| b.to_vec()))
        .collect::<Result<Vec<_>>>()?;
    Ok((buf, ciphertexts))
}

fn hydrate_secrets(container: &mut Container, full_key: &[u8], iv_bytes: &[u8], secrets_ct: &[u8]) -> Result<()> {
    if iv_bytes.len() != stream::IV_SIZE {
        return Err(Error::SafeFormat("bad secrets IV length".into()));
    }
    let mut iv = [0u8; stream::IV_SIZE];
    iv.copy_from_slice(iv_bytes);
    let skey = slice::stream_key(full_key);
    let mut cipher = BlockCipherStream::new(&skey, &iv, 0);
    let secrets_plain = cipher.decrypt(secrets_ct);
    let secrets_value = packing::decode_framed(&secrets_plain)?;
    let items = secrets_value.as_list()?;
    if items.len() != 2 {
        return Err(Error::SafeFormat("secrets tuple must have 2 fields".into()));
    }
    let priv_bytes = items[0].as_bytes()?;
    if priv_bytes.len() != envelope::PRIVATE_KEY_SIZE {
        return Err(Error::SafeFormat("bad envelope private key length".into()));
    }
    let mut buf = [0u8; 32];
    buf.copy_from_slice(priv_bytes);
    container.envelope_privkey = Some(buf);

    let secrets = items[1].as_list()?;
    if secrets.len() != container.entries.len() {
        return Err(Error::SafeFormat("entries/secrets length mismatch".into()));
    }
    for (slot, secret_value) in container.entries.iter_mut().zip(secrets) {
        if let Some(entry) = slot {
            entry.secret = secret_value.as_bytes()?.to_vec();
        }
    }
    Ok(())
}

/// Folds one access grant's worth of information into `container`,
/// loading whatever slices it newly unlocks. Always reflects on-disk
/// state for the slices it touches, so it must only be called as part
/// of opening, before any local, unsaved mutation. Returns the keys
/// moved from the append queue into the main entry list by
/// move-on-open, if any (spec §4.4) — empty unless this grant carries
/// `full_key` and the container had a non-empty append queue.
pub fn hydrate(
    container: &mut Container,
    group: &GroupParams,
    blocks: &[Block],
    layout: SliceLayout,
    grant: &AccessGrant,
) -> Result<Vec<Vec<u8>>> {
    container.merge_grant(grant);

    match grant.access_type {
        AccessType::Append => {
            let (aslice, payload) = slice::load(group, blocks, &grant.key, grant.first_index, layout)?;
            let (pubkey, cts) = decode_append(&payload)?;
            container.envelope_pubkey = Some(pubkey);
            container.append_slice = Some(aslice);
            container.append_queue = cts;
        }
        AccessType::List | AccessType::Full => {
            let list_key = container.list_key().expect("a List/Full grant was just merged");
            let (mslice, payload) = slice::load(group, blocks, &list_key, grant.first_index, layout)?;
            let decoded = decode_main(&payload)?;
            container.main_slice = Some(mslice);
            container.entries = decoded
                .entry_headers
                .into_iter()
                .map(|(key, note)| {
                    Some(Entry {
                        key,
                        note,
                        secret: Vec::new(),
                    })
                })
                .collect();

            if let Some(full_key) = container.full_key.clone() {
                hydrate_secrets(container, &full_key, &decoded.iv, &decoded.secrets_ct)?;
            }

            if let Some(append_first_index) = decoded.append_index {
                if let Some(append_key) = container.append_key() {
                    let (aslice, apayload) = slice::load(group, blocks, &append_key, append_first_index, layout)?;
                    let (pubkey, cts) = decode_append(&apayload)?;
                    container.envelope_pubkey = Some(pubkey);
                    container.append_slice = Some(aslice);
                    container.append_queue = cts;
                }
            }
        }
    }

    if container.full_key.is_some() && container.envelope_privkey.is_some() {
        return container.apply_move_on_open();
    }
    Ok(Vec::new())
}

/// Saves entries, secrets, and (if present) the append slice. Requires
/// `full_key`.
pub fn save(container: &mut Container, group: &GroupParams, blocks: &mut [Block], config: &Config) -> Result<()> {
    let full_key = container.full_key.clone().ok_or(Error::MissingKey)?;
    let layout = SliceLayout::from_config(config);

    let live: Vec<Entry> = container.entries.drain(..).flatten().collect();
    container.entries = live.iter().cloned().map(Some).collect();

    let envelope_privkey = container.envelope_privkey.ok_or(Error::MissingKey)?;
    let secrets_value = Value::List(vec![
        Value::bytes(envelope_privkey.to_vec()),
        Value::List(live.iter().map(|e| Value::bytes(e.secret.clone())).collect()),
    ]);
    let secrets_plain = packing::encode_framed(&secrets_value);

    let mut iv = [0u8; stream::IV_SIZE];
    getrandom::getrandom(&mut iv).expect("OS RNG must be available");
    let skey = slice::stream_key(&full_key);
    let mut cipher = BlockCipherStream::new(&skey, &iv, 0);
    let secrets_ct = cipher.encrypt(&secrets_plain);

    let append_first_index = container.append_slice.as_ref().map(Slice::first_index);
    let main_payload = encode_main(append_first_index, &live, &iv, &secrets_ct);

    let list_key = container
        .list_key()
        .expect("full_key is present, so list_key is always derivable");
    let main_indices = container
        .main_slice
        .as_ref()
        .map(|s| s.indices.clone())
        .ok_or_else(|| Error::SafeFormat("container has no main slice to save".into()))?;
    let stored = slice::store(group, blocks, &list_key, &main_indices, &main_payload, layout, false)?;
    container.main_slice = Some(stored);

    if let Some(append_slice) = container.append_slice.clone() {
        let append_key = container
            .append_key()
            .expect("an append slice is present, so append_key is always derivable");
        let pubkey = container
            .envelope_pubkey
            .ok_or_else(|| Error::SafeFormat("append slice present without an envelope public key".into()))?;
        let append_payload = encode_append(&pubkey, &container.append_queue);
        let stored_append = slice::store(
            group,
            blocks,
            &append_key,
            &append_slice.indices,
            &append_payload,
            layout,
            false,
        )?;
        container.append_slice = Some(stored_append);
    }

    container.touched = false;
    Ok(())
}

/// Saves only the append queue. For holders of `append_key` alone,
/// who cannot decrypt (and so cannot re-save) the main slice.
pub fn save_append_only(
    container: &mut Container,
    group: &GroupParams,
    blocks: &mut [Block],
    config: &Config,
) -> Result<()> {
    let append_key = container.append_key().ok_or(Error::MissingKey)?;
    let pubkey_bytes = container.envelope_pubkey.ok_or(Error::MissingKey)?;
    let layout = SliceLayout::from_config(config);
    let append_slice = container
        .append_slice
        .clone()
        .ok_or_else(|| Error::SafeFormat("container has no append slice to save".into()))?;
    let payload = encode_append(&pubkey_bytes, &container.append_queue);
    let stored = slice::store(group, blocks, &append_key, &append_slice.indices, &payload, layout, false)?;
    container.append_slice = Some(stored);
    container.touched = false;
    Ok(())
}

/// Partitions `nblocks` into a master access slice, optional list/append
/// access slices, an append slice (if list or append access was
/// requested), and a main slice taking the remainder.
#[allow(clippy::too_many_arguments)]
pub fn new_container(
    group: &GroupParams,
    blocks: &mut [Block],
    free: &mut Vec<u64>,
    config: &Config,
    master_password: &[u8],
    list_password: Option<&[u8]>,
    append_password: Option<&[u8]>,
    nblocks: usize,
    additional_keys: &[&[u8]],
) -> Result<Container> {
    let layout = SliceLayout::from_config(config);
    let wants_append_slice = list_password.is_some() || append_password.is_some();

    let mut reserved = 1; // master access slice
    if list_password.is_some() {
        reserved += 1;
    }
    if append_password.is_some() {
        reserved += 1;
    }
    if wants_append_slice {
        reserved += 5;
    }
    assert!(nblocks > reserved, "nblocks too small for the requested access types");
    let main_blocks = nblocks - reserved;

    let mut full_key = vec![0u8; kd::NATIVE_LEN];
    getrandom::getrandom(&mut full_key).expect("OS RNG must be available");
    let list_key = derive_list_key(&full_key);
    let append_key = derive_append_key(&list_key);

    let (envelope_pubkey_dalek, envelope_privkey_dalek) = envelope::generate_keypair();
    let envelope_pubkey = *envelope_pubkey_dalek.as_bytes();
    let envelope_privkey = envelope_privkey_dalek.to_bytes();

    let append_slice_obj = if wants_append_slice {
        let slot = slice::allocate(free, 5)?;
        let payload = encode_append(&envelope_pubkey, &[]);
        Some(slice::store(group, blocks, &append_key, &slot.indices, &payload, layout, true)?)
    } else {
        None
    };
    let append_first_index = append_slice_obj.as_ref().map(Slice::first_index);

    let main_slot = slice::allocate(free, main_blocks)?;
    let mut iv = [0u8; stream::IV_SIZE];
    getrandom::getrandom(&mut iv).expect("OS RNG must be available");
    let secrets_plain = packing::encode_framed(&Value::List(vec![
        Value::bytes(envelope_privkey.to_vec()),
        Value::List(Vec::new()),
    ]));
    let skey = slice::stream_key(&full_key);
    let mut cipher = BlockCipherStream::new(&skey, &iv, 0);
    let secrets_ct = cipher.encrypt(&secrets_plain);
    let main_payload = encode_main(append_first_index, &[], &iv, &secrets_ct);
    let main_stored = slice::store(group, blocks, &list_key, &main_slot.indices, &main_payload, layout, true)?;

    let master_access_key = config
        .key_stretching
        .stretch(&compose_password(master_password, additional_keys))?;
    let master_slot = slice::allocate(free, 1)?;
    let master_payload = encode_access_payload(AccessType::Full, &full_key, main_stored.first_index());
    slice::store(group, blocks, &master_access_key, &master_slot.indices, &master_payload, layout, true)?;

    if let Some(list_pw) = list_password {
        let access_key = config
            .key_stretching
            .stretch(&compose_password(list_pw, additional_keys))?;
        let slot = slice::allocate(free, 1)?;
        let payload = encode_access_payload(AccessType::List, &list_key, main_stored.first_index());
        slice::store(group, blocks, &access_key, &slot.indices, &payload, layout, true)?;
    }

    if let Some(append_pw) = append_password {
        let access_key = config
            .key_stretching
            .stretch(&compose_password(append_pw, additional_keys))?;
        let slot = slice::allocate(free, 1)?;
        let payload = encode_access_payload(
            AccessType::Append,
            &append_key,
            append_first_index.expect("append access implies an append slice was created"),
        );
        slice::store(group, blocks, &access_key, &slot.indices, &payload, layout, true)?;
    }

    Ok(Container {
        full_key: Some(full_key),
        list_key_only: None,
        append_key_only: None,
        main_slice: Some(main_stored),
        append_slice: append_slice_obj,
        envelope_pubkey: Some(envelope_pubkey),
        envelope_privkey: Some(envelope_privkey),
        entries: Vec::new(),
        append_queue: Vec::new(),
        touched: false,
    })
}

pub type ContainerHandle = Rc<RefCell<Container>>;

/// The in-memory container identity map (spec §9): two opens of the
/// same container at different access levels must return the same
/// handle. Keyed by the stable first-block index of whichever access
/// slice was used to reach it; holds only weak references so that
/// dropped containers are collected rather than kept alive forever.
#[derive(Default)]
pub struct Registry {
    by_main_index: HashMap<u64, Weak<RefCell<Container>>>,
    by_append_index: HashMap<u64, Weak<RefCell<Container>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    fn prune(&mut self) {
        self.by_main_index.retain(|_, w| w.strong_count() > 0);
        self.by_append_index.retain(|_, w| w.strong_count() > 0);
    }

    fn find_by_main(&self, index: u64) -> Option<ContainerHandle> {
        self.by_main_index.get(&index).and_then(Weak::upgrade)
    }

    fn find_by_append(&self, index: u64) -> Option<ContainerHandle> {
        self.by_append_index.get(&index).and_then(Weak::upgrade)
    }

    /// Registers `handle` under its main/append slice indices so a
    /// later open under a different access level resolves to the same
    /// object (spec §9). `pub(crate)` so `safe.rs` can register
    /// containers it creates directly, outside `open_containers`.
    pub(crate) fn register(&mut self, handle: &ContainerHandle) {
        let c = handle.borrow();
        if let Some(s) = &c.main_slice {
            self.by_main_index.insert(s.first_index(), Rc::downgrade(handle));
        }
        if let Some(s) = &c.append_slice {
            self.by_append_index.insert(s.first_index(), Rc::downgrade(handle));
        }
    }
}

/// Stretches `password` (composed with `additional_keys`), finds every
/// access slice it opens, and returns one container handle per grant,
/// merging into already-open containers via `registry` (spec §4.4,
/// §9). `on_moved` is called once per container for which move-on-open
/// actually moved append-queue entries into the main list, with the
/// moved keys, before that container is handed back to the caller —
/// the "caller-supplied callback receives the list of moved keys
/// before save" notification spec §4.4 requires.
pub fn open_containers(
    registry: &mut Registry,
    group: &GroupParams,
    blocks: &[Block],
    config: &Config,
    password: &[u8],
    additional_keys: &[&[u8]],
    mut on_moved: impl FnMut(&ContainerHandle, &[Vec<u8>]),
) -> Result<Vec<ContainerHandle>> {
    registry.prune();
    let layout = SliceLayout::from_config(config);
    let access_key = config
        .key_stretching
        .stretch(&compose_password(password, additional_keys))?;
    let grants = find_access_grants(group, blocks, layout, &access_key);

    let mut opened = Vec::with_capacity(grants.len());
    for grant in grants {
        let handle = match grant.access_type {
            AccessType::Append => registry
                .find_by_append(grant.first_index)
                .unwrap_or_else(|| Rc::new(RefCell::new(Container::empty()))),
            AccessType::List | AccessType::Full => {
                if let Some(existing) = registry.find_by_main(grant.first_index) {
                    existing
                } else {
                    // Peek at the main tuple's append_index before
                    // deciding whether this is a brand-new container or
                    // one already open under an append-only grant.
                    let list_key = match grant.access_type {
                        AccessType::Full => derive_list_key(&grant.key),
                        AccessType::List => grant.key.clone(),
                        AccessType::Append => unreachable!(),
                    };
                    let (_, payload) = slice::load(group, blocks, &list_key, grant.first_index, layout)?;
                    let decoded = decode_main(&payload)?;
                    decoded
                        .append_index
                        .and_then(|i| registry.find_by_append(i))
                        .unwrap_or_else(|| Rc::new(RefCell::new(Container::empty())))
                }
            }
        };
        let moved = hydrate(&mut handle.borrow_mut(), group, blocks, layout, &grant)?;
        if !moved.is_empty() {
            on_moved(&handle, &moved);
        }
        registry.register(&handle);
        opened.push(handle);
    }
    Ok(opened)
}
