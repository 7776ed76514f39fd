//! Safe facade: file load/store, file lock, container factory, and
//! the rerandomize-on-close deniability hinge (C5 — spec §4.5, §9).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use fs2::FileExt;

use crate::block::Block;
use crate::config::Config;
use crate::container::{self, ContainerHandle, Registry};
use crate::error::{Error, Result};
use crate::group::GroupParams;
use crate::magic::{self, AccessType};
use crate::packing::{self, Value};
use crate::parallel;
use crate::slice::SliceLayout;

/// Block count per `parallel_map` chunk during the rerandomization
/// pass; a block's rerandomization is cheap, so chunks amortize the
/// per-task scheduling overhead without starving any worker.
const RERANDOMIZE_CHUNK: usize = 32;
const DEFAULT_WORKERS: usize = 4;

pub struct Safe {
    path: PathBuf,
    file: File,
    readonly: bool,
    config: Config,
    blocks: Vec<Block>,
    free: Vec<u64>,
    registry: Registry,
    opened: Vec<ContainerHandle>,
    closed: bool,
}

impl Safe {
    /// Creates a brand-new safe: exclusive file lock, `config.n_blocks`
    /// freshly rerandomized-looking unclaimed blocks, and the packed
    /// header written to disk immediately (spec §4.5).
    pub fn create(path: &Path, config: Config) -> Result<Safe> {
        config.validate()?;
        if path.exists() {
            return Err(Error::SafeAlreadyExists);
        }
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        file.try_lock_exclusive().map_err(|_| Error::SafeLocked)?;

        let blocks: Vec<Block> = (0..config.n_blocks).map(|_| Block::random_unclaimed(&config.group)).collect();
        let free: Vec<u64> = (0..config.n_blocks as u64).collect();

        let mut safe = Safe {
            path: path.to_path_buf(),
            file,
            readonly: false,
            config,
            blocks,
            free,
            registry: Registry::new(),
            opened: Vec::new(),
            closed: false,
        };
        safe.write_file()?;
        log::info!("created safe at {} with {} blocks", safe.path.display(), safe.config.n_blocks);
        Ok(safe)
    }

    /// Opens an existing safe. `readonly` takes a shared lock instead
    /// of an exclusive one and skips the close-time autosave and
    /// rerandomization pass entirely, leaving the file byte-identical.
    pub fn open(path: &Path, readonly: bool) -> Result<Safe> {
        if !path.exists() {
            return Err(Error::SafeNotFound);
        }
        let mut file = OpenOptions::new().read(true).write(!readonly).open(path)?;
        let lock_result = if readonly { file.try_lock_shared() } else { file.try_lock_exclusive() };
        lock_result.map_err(|_| Error::SafeLocked)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let tag_end = magic::FILE_MAGIC.len();
        let header_start = tag_end + magic::FILE_MAGIC_TAIL.len();
        if bytes.len() < header_start || &bytes[..tag_end] != magic::FILE_MAGIC || bytes[tag_end..header_start] != magic::FILE_MAGIC_TAIL {
            return Err(Error::WrongMagic);
        }

        let header = packing::decode_all(&bytes[header_start..])?;
        let config = Config::from_value(&header)?;
        let blocks = blocks_from_value(header.map_get("blocks")?)?;
        if blocks.len() != config.n_blocks {
            return Err(Error::SafeFormat("block array length does not match n-blocks".into()));
        }

        log::info!("opened safe at {} (readonly={readonly})", path.display());
        Ok(Safe {
            path: path.to_path_buf(),
            file,
            readonly,
            // Nothing is known claimed yet; each `open_containers` call
            // below narrows this towards the truth, never the other
            // way (spec §9: "no hidden state").
            free: (0..config.n_blocks as u64).collect(),
            config,
            blocks,
            registry: Registry::new(),
            opened: Vec::new(),
            closed: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn group(&self) -> &GroupParams {
        &self.config.group
    }

    /// Blocks not yet reachable from any access slice opened so far.
    /// A caller who never supplies every password this safe holds
    /// never learns the true free set; that is by design (spec §9).
    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Allocates and stores a brand-new container, claiming `nblocks`
    /// from the free set.
    #[allow(clippy::too_many_arguments)]
    pub fn new_container(
        &mut self,
        master_password: &[u8],
        list_password: Option<&[u8]>,
        append_password: Option<&[u8]>,
        nblocks: usize,
        additional_keys: &[&[u8]],
    ) -> Result<ContainerHandle> {
        if self.readonly {
            return Err(Error::MissingKey);
        }
        let group = self.config.group.clone();
        let container = container::new_container(
            &group,
            &mut self.blocks,
            &mut self.free,
            &self.config,
            master_password,
            list_password,
            append_password,
            nblocks,
            additional_keys,
        )?;
        let handle: ContainerHandle = Rc::new(std::cell::RefCell::new(container));
        self.registry.register(&handle);
        self.opened.push(handle.clone());
        Ok(handle)
    }

    /// Stretches `password` (composed with `additional_keys`) and
    /// returns every container it opens, narrowing the free set by
    /// whatever access and main/append slices it finds along the way.
    /// Equivalent to [`Safe::open_containers_notify`] with a no-op
    /// move-on-open callback.
    pub fn open_containers(&mut self, password: &[u8], additional_keys: &[&[u8]]) -> Result<Vec<ContainerHandle>> {
        self.open_containers_notify(password, additional_keys, |_, _| {})
    }

    /// As [`Safe::open_containers`], but `on_moved` is called once per
    /// container for which move-on-open actually moved append-queue
    /// entries into the main list, with the moved keys, before that
    /// container is handed back — the notification spec §4.4 requires
    /// ("a caller-supplied callback receives the list of moved keys
    /// before save").
    pub fn open_containers_notify(
        &mut self,
        password: &[u8],
        additional_keys: &[&[u8]],
        on_moved: impl FnMut(&ContainerHandle, &[Vec<u8>]),
    ) -> Result<Vec<ContainerHandle>> {
        let layout = SliceLayout::from_config(&self.config);
        let access_key = self.config.key_stretching.stretch(&container::compose_password(password, additional_keys))?;
        let grants = container::find_access_grants(&self.config.group, &self.blocks, layout, &access_key);
        for grant in &grants {
            self.reserve(&grant.access_slice.indices);
        }

        let handles = container::open_containers(
            &mut self.registry,
            &self.config.group,
            &self.blocks,
            &self.config,
            password,
            additional_keys,
            on_moved,
        )?;
        for handle in &handles {
            let c = handle.borrow();
            if let Some(s) = &c.main_slice {
                self.reserve(&s.indices);
            }
            if let Some(s) = &c.append_slice {
                self.reserve(&s.indices);
            }
        }
        self.opened.extend(handles.iter().cloned());
        Ok(handles)
    }

    fn reserve(&mut self, indices: &[u64]) {
        self.free.retain(|i| !indices.contains(i));
    }

    /// Claims the entire remaining free set into one decoy slice
    /// filled with uniform-random plaintext under a key nobody holds
    /// (spec §3, §8 scenario 6). After this the free set is empty.
    pub fn trash_freespace(&mut self) -> Result<()> {
        if self.readonly {
            return Err(Error::MissingKey);
        }
        let layout = SliceLayout::from_config(&self.config);
        crate::slice::trash_freespace(&self.config.group, &mut self.blocks, &mut self.free, layout)?;
        Ok(())
    }

    /// Autosaves every touched open container, rerandomizes all N
    /// blocks, and rewrites the file — unless the safe was opened
    /// readonly, in which case this is a no-op and the file is left
    /// byte-identical (spec §4.5, §9, §8 scenario 4).
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.readonly {
            return Ok(());
        }

        for handle in &self.opened {
            let (touched, access_level) = {
                let c = handle.borrow();
                (c.is_touched(), c.access_level())
            };
            if !touched {
                continue;
            }
            match access_level {
                Some(AccessType::Full) => {
                    container::save(&mut handle.borrow_mut(), &self.config.group, &mut self.blocks, &self.config)?;
                }
                Some(AccessType::Append) => {
                    container::save_append_only(&mut handle.borrow_mut(), &self.config.group, &mut self.blocks, &self.config)?;
                }
                Some(AccessType::List) => {
                    log::warn!("list-only container marked touched; list access cannot mutate, ignoring");
                }
                None => {}
            }
        }

        // The deniability hinge: every write path ends in a
        // rerandomize of all N blocks, unconditionally, regardless of
        // whether any container was touched (spec §9). This must
        // never be skipped as a "no changes" optimization.
        let group = self.config.group.clone();
        let rerandomized = parallel::parallel_map(&self.blocks, RERANDOMIZE_CHUNK, DEFAULT_WORKERS, |b| crate::block::rerandomize(&group, b));
        self.blocks = rerandomized;

        self.write_file()?;
        log::info!("closed safe at {}, {} blocks rerandomized", self.path.display(), self.blocks.len());
        Ok(())
    }

    fn write_file(&mut self) -> Result<()> {
        let mut out = Vec::with_capacity(magic::FILE_MAGIC.len() + magic::FILE_MAGIC_TAIL.len() + self.blocks.len() * self.config.bytes_per_block);
        out.extend_from_slice(magic::FILE_MAGIC);
        out.extend_from_slice(&magic::FILE_MAGIC_TAIL);
        out.extend(packing::encode(&header_value(&self.config, &self.blocks)));

        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(&out)?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for Safe {
    /// Best-effort safety net: a caller that drops a `Safe` without
    /// calling `close` still gets the rerandomize-on-close guarantee
    /// (the file lock always releases via the `File`'s own `Drop`
    /// regardless). Errors here can't propagate; call `close`
    /// explicitly to observe them.
    fn drop(&mut self) {
        if !self.closed && !self.readonly {
            if let Err(e) = self.close_inner() {
                log::error!("error closing safe on drop: {e}");
            }
        }
    }
}

fn blocks_to_value(blocks: &[Block]) -> Value {
    Value::List(
        blocks
            .iter()
            .map(|b| {
                Value::List(vec![
                    Value::Int(b.c1.clone()),
                    Value::Int(b.c2.clone()),
                    Value::Int(b.pubkey.clone()),
                    Value::bytes(b.marker.clone()),
                ])
            })
            .collect(),
    )
}

fn blocks_from_value(value: &Value) -> Result<Vec<Block>> {
    value
        .as_list()?
        .iter()
        .map(|item| {
            let fields = item.as_list()?;
            if fields.len() != 4 {
                return Err(Error::SafeFormat("block tuple must have 4 fields".into()));
            }
            Ok(Block {
                c1: fields[0].as_int()?.clone(),
                c2: fields[1].as_int()?.clone(),
                pubkey: fields[2].as_int()?.clone(),
                marker: fields[3].as_bytes()?.to_vec(),
            })
        })
        .collect()
}

fn header_value(config: &Config, blocks: &[Block]) -> Value {
    let mut entries = match config.to_value() {
        Value::Map(e) => e,
        _ => unreachable!("Config::to_value always returns a Map"),
    };
    entries.push((b"blocks".to_vec(), blocks_to_value(blocks)));
    Value::Map(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupParams;
    use crate::ks::KeyStretching;
    use num_bigint::BigUint;
    use tempfile::tempdir;

    fn test_config() -> Config {
        Config {
            n_blocks: 70,
            bytes_per_block: 40,
            block_index_size: 2,
            slice_size_field: 2,
            group: GroupParams::generate(336),
            key_stretching: KeyStretching::Argon2id {
                time_cost: 1,
                mem_cost_kib: 8,
                parallelism: 1,
                salt: vec![0u8; 16],
            },
        }
    }

    #[test]
    fn create_then_open_roundtrips_header_and_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("safe.dnv");
        let config = test_config();
        let n_blocks = config.n_blocks;
        {
            let safe = Safe::create(&path, config).unwrap();
            safe.close().unwrap();
        }
        let reopened = Safe::open(&path, true).unwrap();
        assert_eq!(reopened.config().n_blocks, n_blocks);
        assert_eq!(reopened.blocks.len(), n_blocks);
    }

    #[test]
    fn open_nonexistent_path_fails_safe_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.dnv");
        assert!(matches!(Safe::open(&path, true), Err(Error::SafeNotFound)));
    }

    #[test]
    fn create_twice_fails_safe_already_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("safe.dnv");
        let config = test_config();
        let safe = Safe::create(&path, config).unwrap();
        let config2 = test_config();
        assert!(matches!(Safe::create(&path, config2), Err(Error::SafeAlreadyExists)));
        safe.close().unwrap();
    }

    #[test]
    fn readonly_open_leaves_bytes_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("safe.dnv");
        {
            let safe = Safe::create(&path, test_config()).unwrap();
            safe.close().unwrap();
        }
        let before = std::fs::read(&path).unwrap();
        let safe = Safe::open(&path, true).unwrap();
        safe.close().unwrap();
        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn read_write_open_rerandomizes_every_block_but_containers_still_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("safe.dnv");
        {
            let mut safe = Safe::create(&path, test_config()).unwrap();
            safe.new_container(b"m", None, None, 20, &[]).unwrap();
            safe.close().unwrap();
        }
        let before = std::fs::read(&path).unwrap();
        {
            let safe = Safe::open(&path, false).unwrap();
            safe.close().unwrap();
        }
        let after = std::fs::read(&path).unwrap();
        assert_ne!(before, after);

        let mut safe = Safe::open(&path, true).unwrap();
        let opened = safe.open_containers(b"m", &[]).unwrap();
        assert_eq!(opened.len(), 1);
    }

    #[test]
    fn new_container_shrinks_free_set_and_safe_full_on_overflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("safe.dnv");
        let mut config = test_config();
        config.n_blocks = 10;
        let mut safe = Safe::create(&path, config).unwrap();
        assert_eq!(safe.free_blocks(), 10);
        safe.new_container(b"m", None, None, 10, &[]).unwrap();
        assert_eq!(safe.free_blocks(), 0);
        assert!(matches!(
            safe.new_container(b"other", None, None, 2, &[]),
            Err(Error::SafeFull { needed: 1, available: 0 })
        ));
        safe.close().unwrap();
    }

    #[test]
    fn append_then_reopen_with_master_sees_moved_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("safe.dnv");
        {
            let mut safe = Safe::create(&path, test_config()).unwrap();
            safe.new_container(b"m", Some(b"l"), Some(b"a"), 70, &[]).unwrap();
            safe.close().unwrap();
        }
        {
            let mut safe = Safe::open(&path, false).unwrap();
            let opened = safe.open_containers(b"a", &[]).unwrap();
            assert_eq!(opened.len(), 1);
            opened[0].borrow_mut().append(b"k1".to_vec(), b"n1".to_vec(), b"s1".to_vec()).unwrap();
            safe.close().unwrap();
        }
        {
            let mut safe = Safe::open(&path, false).unwrap();
            let mut moved_keys = Vec::new();
            let opened = safe
                .open_containers_notify(b"m", &[], |_, moved| moved_keys.extend(moved.iter().cloned()))
                .unwrap();
            assert_eq!(opened.len(), 1);
            assert_eq!(moved_keys, vec![b"k1".to_vec()]);
            let entries = opened[0].borrow().list();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].key, b"k1");
            assert_eq!(entries[0].note, b"n1");
            safe.close().unwrap();
        }
    }

    #[test]
    fn additional_keys_order_is_irrelevant_but_required() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("safe.dnv");
        {
            let mut safe = Safe::create(&path, test_config()).unwrap();
            safe.new_container(b"m", None, None, 20, &["a".as_bytes(), "b".as_bytes()]).unwrap();
            safe.close().unwrap();
        }
        let mut safe = Safe::open(&path, true).unwrap();
        assert!(safe.open_containers(b"m", &[]).unwrap().is_empty());
        assert_eq!(safe.open_containers(b"m", &["b".as_bytes(), "a".as_bytes()]).unwrap().len(), 1);
    }

    #[test]
    fn trash_freespace_leaves_block_count_unchanged_and_empties_free_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("safe.dnv");
        let mut config = test_config();
        config.n_blocks = 30;
        let mut safe = Safe::create(&path, config).unwrap();
        safe.new_container(b"m", None, None, 10, &[]).unwrap();
        let before_len = safe.blocks.len();
        safe.trash_freespace().unwrap();
        assert_eq!(safe.blocks.len(), before_len);
        assert_eq!(safe.free_blocks(), 0);
        safe.close().unwrap();
    }

    #[test]
    fn blocks_from_value_rejects_non_list_payload() {
        let value = Value::Int(BigUint::from(0u32));
        assert!(blocks_from_value(&value).is_err());
    }
}
