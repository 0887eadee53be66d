//! Want validation policies.

use std::collections::{HashSet, VecDeque};

use wharf_hash::ObjectId;
use wharf_serve_core::store::{ObjectDatabase, ObjectKind};
use wharf_serve_core::visibility::RefRecord;

use crate::error::{Error, Result};

/// Which object ids a client may legitimately `want`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestPolicy {
    /// Only ids that were advertised, peeled tag targets included.
    #[default]
    Advertised,
    /// Advertised ids, or commits reachable from an advertised ref.
    ReachableCommit,
    /// Reachable commits, or the tip of any ref, hidden ones included.
    ReachableCommitTip,
    /// The tip of any ref, hidden ones included.
    Tip,
    /// Any object present in the repository.
    Any,
}

/// Validate every want against `policy`.
///
/// `advertised` is the set the client saw; `all_refs` additionally holds
/// hidden refs, whose tips the `Tip` policies accept.
pub fn validate_wants<O: ObjectDatabase>(
    policy: RequestPolicy,
    wants: &[ObjectId],
    advertised: &[RefRecord],
    all_refs: &[RefRecord],
    odb: &O,
) -> Result<()> {
    let advertised_ids = id_set(advertised);
    let tip_ids = id_set(all_refs);

    let mut reachable: Option<HashSet<ObjectId>> = None;
    for want in wants {
        let allowed = match policy {
            RequestPolicy::Advertised => advertised_ids.contains(want),
            RequestPolicy::Tip => advertised_ids.contains(want) || tip_ids.contains(want),
            RequestPolicy::ReachableCommit => {
                advertised_ids.contains(want)
                    || reachable_set(&mut reachable, &advertised_ids, odb)?.contains(want)
            }
            RequestPolicy::ReachableCommitTip => {
                advertised_ids.contains(want)
                    || tip_ids.contains(want)
                    || reachable_set(&mut reachable, &advertised_ids, odb)?.contains(want)
            }
            RequestPolicy::Any => odb.contains(want),
        };
        if !allowed {
            tracing::warn!(oid = %want, ?policy, "refusing want");
            return Err(Error::WantNotAllowed { oid: *want });
        }
    }
    Ok(())
}

fn id_set(refs: &[RefRecord]) -> HashSet<ObjectId> {
    let mut ids = HashSet::with_capacity(refs.len() * 2);
    for record in refs {
        if let Some(id) = record.object_id() {
            ids.insert(id);
        }
        if let Some(peeled) = record.peeled {
            ids.insert(peeled);
        }
    }
    ids
}

/// Commits reachable from the advertised tips, computed once per request
/// and only when a policy needs it.
fn reachable_set<'a, O: ObjectDatabase>(
    cache: &'a mut Option<HashSet<ObjectId>>,
    tips: &HashSet<ObjectId>,
    odb: &O,
) -> Result<&'a HashSet<ObjectId>> {
    if cache.is_none() {
        let mut reachable = HashSet::new();
        let mut queue: VecDeque<ObjectId> = tips.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id) {
                continue;
            }
            let Some(info) = odb.info(&id)? else { continue };
            match info.kind {
                ObjectKind::Commit => queue.extend(info.parents()),
                ObjectKind::Tag => queue.extend(info.links.iter().map(|l| l.id)),
                ObjectKind::Tree | ObjectKind::Blob => {}
            }
        }
        *cache = Some(reachable);
    }
    Ok(cache.as_ref().expect("populated above"))
}
