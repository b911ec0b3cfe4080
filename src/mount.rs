//! Path-prefix mount table.
//!
//! Maps normalized URL prefixes to handlers. Every mutation rebuilds the
//! prefix scanner and publishes a fresh immutable snapshot, so a dispatch
//! running concurrently with `mount`/`unmount` sees either the old table or
//! the new one, never a half-built scanner.
//!
//! ```text
//! set / remove
//!     → lock writer
//!     → copy entries, apply change
//!     → compile scanner (prefixes, longest first)
//!     → publish snapshot (ArcSwap::store)
//!
//! resolve
//!     → load snapshot (lock-free)
//!     → first prefix that ends on a segment boundary of the path wins
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::handler::BoxedHandler;

/// Opaque per-mount configuration handed to the handler with each request.
///
/// Handlers read it back with [`Request::options`](crate::Request::options).
#[derive(Clone, Default)]
pub struct MountOptions(Option<Arc<dyn Any + Send + Sync>>);

impl MountOptions {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.0.as_deref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "MountOptions(..)" } else { "MountOptions(none)" })
    }
}

#[derive(Clone)]
struct Mount {
    handler: BoxedHandler,
    options: MountOptions,
}

/// A successful path resolution.
pub struct Resolution {
    pub handler: BoxedHandler,
    pub options: MountOptions,
    /// The registered prefix that matched (`""` for the root mount).
    pub script_name: String,
    /// Unmatched suffix of the path, possibly empty.
    pub path_info: String,
}

#[derive(Default)]
struct Snapshot {
    entries: HashMap<String, Mount>,
    /// Registered prefixes, longest first.
    scanner: Vec<String>,
}

impl Snapshot {
    fn compile(entries: HashMap<String, Mount>) -> Self {
        let mut scanner: Vec<String> = entries.keys().cloned().collect();
        scanner.sort_unstable_by(|a, b| b.len().cmp(&a.len()).then_with(|| b.cmp(a)));
        Self { entries, scanner }
    }
}

/// Mapping from URL path prefixes to handlers.
pub struct MountTable {
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
}

impl MountTable {
    pub fn new() -> Self {
        Self { snapshot: ArcSwap::from_pointee(Snapshot::default()), writer: Mutex::new(()) }
    }

    /// Registers `handler` under `prefix`, replacing any previous entry with
    /// the same normalized prefix.
    pub fn set(&self, prefix: &str, handler: BoxedHandler, options: MountOptions) {
        let key = normalize(prefix);
        self.update(|entries| {
            entries.insert(key, Mount { handler, options });
        });
    }

    /// Removes the entry for `prefix`. Returns whether one existed.
    pub fn remove(&self, prefix: &str) -> bool {
        let key = normalize(prefix);
        let mut existed = false;
        self.update(|entries| existed = entries.remove(&key).is_some());
        existed
    }

    /// Finds the longest registered prefix of `path` that ends on a path
    /// segment boundary.
    pub fn resolve(&self, path: &str) -> Option<Resolution> {
        let snapshot = self.snapshot.load();
        let prefix = snapshot.scanner.iter().find(|prefix| is_segment_prefix(prefix, path))?;
        let mount = snapshot.entries.get(prefix)?;

        Some(Resolution {
            handler: Arc::clone(&mount.handler),
            options: mount.options.clone(),
            script_name: prefix.clone(),
            path_info: path[prefix.len()..].to_owned(),
        })
    }

    /// Registered prefixes in the order the scanner tries them.
    pub fn prefixes(&self) -> Vec<String> {
        self.snapshot.load().scanner.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy, mutate, recompile and publish, all under the writer lock.
    fn update(&self, apply: impl FnOnce(&mut HashMap<String, Mount>)) {
        let _guard = self.writer.lock();
        let mut entries = self.snapshot.load().entries.clone();
        apply(&mut entries);
        self.snapshot.store(Arc::new(Snapshot::compile(entries)));
    }
}

impl Default for MountTable {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for MountTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountTable").field("prefixes", &self.prefixes()).finish()
    }
}

/// Strips trailing slashes; the root collapses to `""`.
fn normalize(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_owned()
}

fn is_segment_prefix(prefix: &str, path: &str) -> bool {
    path.starts_with(prefix)
        && matches!(path.as_bytes().get(prefix.len()), None | Some(b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::request::Request;

    fn handler() -> BoxedHandler {
        (|_req: Request| async { "ok" }).into_boxed_handler()
    }

    fn table(prefixes: &[&str]) -> MountTable {
        let table = MountTable::new();
        for prefix in prefixes {
            table.set(prefix, handler(), MountOptions::none());
        }
        table
    }

    fn resolved(table: &MountTable, path: &str) -> Option<(String, String)> {
        table.resolve(path).map(|r| (r.script_name, r.path_info))
    }

    #[test]
    fn empty_table_resolves_nothing() {
        let table = MountTable::new();
        assert!(table.is_empty());
        assert!(table.resolve("/").is_none());
        assert!(table.resolve("/anything").is_none());
    }

    #[test]
    fn sibling_with_shared_byte_prefix_is_not_shadowed() {
        let table = table(&["/foo", "/foo-bar"]);

        assert_eq!(resolved(&table, "/foo-bar/x"), Some(("/foo-bar".into(), "/x".into())));
        assert_eq!(resolved(&table, "/foo/x"), Some(("/foo".into(), "/x".into())));
        assert_eq!(resolved(&table, "/foo"), Some(("/foo".into(), "".into())));
        assert_eq!(resolved(&table, "/foobar"), None);
    }

    #[test]
    fn deepest_prefix_wins() {
        let table = table(&["/", "/a", "/a/b"]);

        assert_eq!(resolved(&table, "/a/b/c"), Some(("/a/b".into(), "/c".into())));
        assert_eq!(resolved(&table, "/a/bc"), Some(("/a".into(), "/bc".into())));
        assert_eq!(resolved(&table, "/z"), Some(("".into(), "/z".into())));
        assert_eq!(table.prefixes(), vec!["/a/b".to_owned(), "/a".to_owned(), "".to_owned()]);
    }

    #[test]
    fn trailing_slashes_collapse_to_one_entry() {
        let table = table(&["/docs/", "/docs"]);
        assert_eq!(table.len(), 1);
        assert_eq!(resolved(&table, "/docs/index"), Some(("/docs".into(), "/index".into())));

        let root = self::table(&["/"]);
        assert_eq!(root.prefixes(), vec!["".to_owned()]);
    }

    #[test]
    fn remove_is_idempotent() {
        let table = table(&["/", "/app"]);

        assert!(table.remove("/app/"));
        assert!(!table.remove("/app"));
        assert_eq!(resolved(&table, "/app/x"), Some(("".into(), "/app/x".into())));

        assert!(table.remove("/"));
        assert!(table.resolve("/app/x").is_none());
    }

    #[test]
    fn re_registration_replaces_options() {
        let table = MountTable::new();
        table.set("/x", handler(), MountOptions::new(1_u32));
        table.set("/x/", handler(), MountOptions::new(2_u32));

        let resolution = table.resolve("/x").unwrap();
        assert_eq!(resolution.options.get::<u32>(), Some(&2));
        assert!(resolution.options.get::<String>().is_none());
    }

    #[test]
    fn concurrent_registration_never_loses_entries() {
        let table = Arc::new(MountTable::new());
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        table.set(&format!("/w{i}/{j}"), handler(), MountOptions::none());
                        assert!(table.resolve(&format!("/w{i}/{j}/leaf")).is_some());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(table.len(), 200);
    }
}
