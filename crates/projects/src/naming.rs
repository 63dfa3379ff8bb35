//! Compose project names and production content hashes.
//!
//! Every project gets its own compose project name so container groups never
//! collide. Production variants additionally carry the content hash of the
//! sources they were built from, so several deployed versions can coexist.

use sha2::{Digest, Sha256};

use sandcastle_core::ProjectId;

/// Prefix shared by every compose project this system manages.
pub const NAME_PREFIX: &str = "sc";

/// Length (hex chars) of a production content hash.
pub const HASH_LEN: usize = 12;

/// Compose project name of the development container group.
pub fn compose_project_name(project_id: &ProjectId) -> String {
    format!("{NAME_PREFIX}-{}", project_id.as_str().to_ascii_lowercase())
}

/// Compose project name of a production deployment.
pub fn production_project_name(project_id: &ProjectId, hash: &str) -> String {
    format!("{}-prod-{hash}", compose_project_name(project_id))
}

/// Named volume holding a project's workspace inside the container group.
pub fn volume_name(project_id: &ProjectId) -> String {
    format!("{}-workspace", compose_project_name(project_id))
}

/// Hash a set of `(relative path, contents)` entries.
///
/// Order-independent: entries are sorted by path first. Paths and contents
/// are length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
pub fn content_hash<P, B>(entries: impl IntoIterator<Item = (P, B)>) -> String
where
    P: AsRef<str>,
    B: AsRef<[u8]>,
{
    let mut entries: Vec<(P, B)> = entries.into_iter().collect();
    entries.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));

    let mut hasher = Sha256::new();
    for (path, bytes) in &entries {
        let path = path.as_ref().as_bytes();
        let bytes = bytes.as_ref();
        hasher.update((path.len() as u64).to_be_bytes());
        hasher.update(path);
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_LEN].to_string()
}

/// Whether `hash` looks like a value produced by [`content_hash`].
pub fn is_content_hash(hash: &str) -> bool {
    hash.len() == HASH_LEN && hash.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pid(s: &str) -> ProjectId {
        ProjectId::parse(s).unwrap()
    }

    #[test]
    fn names_are_derived_from_project_id() {
        let id = pid("Demo_1");
        assert_eq!(compose_project_name(&id), "sc-demo_1");
        assert_eq!(
            production_project_name(&id, "0123456789ab"),
            "sc-demo_1-prod-0123456789ab"
        );
        assert_eq!(volume_name(&id), "sc-demo_1-workspace");
    }

    #[test]
    fn hash_ignores_entry_order() {
        let a = content_hash([("index.html", "hi"), ("src/app.js", "x")]);
        let b = content_hash([("src/app.js", "x"), ("index.html", "hi")]);
        assert_eq!(a, b);
        assert!(is_content_hash(&a));
    }

    #[test]
    fn hash_distinguishes_path_boundaries() {
        let a = content_hash([("ab", "c")]);
        let b = content_hash([("a", "bc")]);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_changes_with_contents() {
        let a = content_hash([("index.html", "v1")]);
        let b = content_hash([("index.html", "v2")]);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_non_hash_strings() {
        assert!(!is_content_hash("0123456789AB"));
        assert!(!is_content_hash("0123"));
        assert!(!is_content_hash("0123456789ag"));
    }

    proptest! {
        #[test]
        fn hash_is_always_well_formed(files in proptest::collection::vec(("[a-z/]{1,12}", ".*"), 0..8)) {
            let h = content_hash(files);
            prop_assert!(is_content_hash(&h));
        }
    }
}
