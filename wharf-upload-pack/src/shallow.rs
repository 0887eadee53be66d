//! Compute the shallow boundary for deepen requests.

use std::collections::{HashMap, HashSet, VecDeque};

use wharf_hash::ObjectId;
use wharf_serve_core::filter::DeepenSpec;
use wharf_serve_core::store::{ObjectDatabase, ObjectKind, RefDatabase, StoreError};

use crate::error::Result;

/// The boundary lines to send before the pack: `shallow <oid>` for commits
/// whose parents are being withheld, `unshallow <oid>` for previously
/// shallow commits whose history the new cut includes again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShallowUpdate {
    /// Commits that become shallow on the client.
    pub shallow: Vec<ObjectId>,
    /// Commits that stop being shallow on the client.
    pub unshallow: Vec<ObjectId>,
}

impl ShallowUpdate {
    /// Whether there is anything to announce.
    pub fn is_empty(&self) -> bool {
        self.shallow.is_empty() && self.unshallow.is_empty()
    }
}

/// Compute the cut for `deepen` against the given wants.
pub fn compute<O: ObjectDatabase, R: RefDatabase + ?Sized>(
    deepen: &DeepenSpec,
    wants: &[ObjectId],
    odb: &O,
    refs: &R,
) -> Result<ShallowUpdate> {
    let client_shallow: HashSet<ObjectId> = deepen.client_shallow.iter().copied().collect();
    let mut update = if deepen.depth > 0 {
        by_depth(deepen.depth, wants, &client_shallow, odb)?
    } else if deepen.since > 0 {
        by_time(deepen.since, wants, &client_shallow, odb)?
    } else if !deepen.not.is_empty() {
        by_exclusion(&deepen.not, wants, &client_shallow, odb, refs)?
    } else {
        ShallowUpdate::default()
    };
    update.shallow.sort_unstable();
    update.shallow.dedup();
    update.unshallow.sort_unstable();
    update.unshallow.dedup();
    Ok(update)
}

fn commit_parents<O: ObjectDatabase>(odb: &O, id: ObjectId) -> std::result::Result<Vec<ObjectId>, StoreError> {
    Ok(match odb.info(&id)? {
        Some(info) if info.kind == ObjectKind::Commit => info.parents().collect(),
        _ => Vec::new(),
    })
}

/// Walk from the wants, keeping the first `depth` generations. Commits on
/// the last kept generation that still have parents become shallow.
fn by_depth<O: ObjectDatabase>(
    depth: u32,
    wants: &[ObjectId],
    client_shallow: &HashSet<ObjectId>,
    odb: &O,
) -> Result<ShallowUpdate> {
    let mut update = ShallowUpdate::default();
    let mut depths: HashMap<ObjectId, u32> = HashMap::new();
    let mut queue: VecDeque<(ObjectId, u32)> = wants.iter().map(|w| (*w, 1)).collect();

    while let Some((id, generation)) = queue.pop_front() {
        match depths.get(&id) {
            Some(best) if *best <= generation => continue,
            _ => {}
        }
        depths.insert(id, generation);

        let parents = commit_parents(odb, id)?;
        if generation >= depth {
            if !parents.is_empty() {
                update.shallow.push(id);
            }
            continue;
        }
        for parent in parents {
            queue.push_back((parent, generation + 1));
        }
    }

    // A commit shallow on the client but now strictly inside the cut gets
    // its parents back.
    for id in client_shallow {
        if depths.get(id).is_some_and(|g| *g < depth) {
            update.unshallow.push(*id);
        }
    }
    // A commit can first be met on the boundary and later via a shorter
    // path; only the shortest generation decides.
    update.shallow.retain(|id| depths[id] >= depth);
    Ok(update)
}

/// Keep commits not older than `since`; older parents are cut off.
fn by_time<O: ObjectDatabase>(
    since: i64,
    wants: &[ObjectId],
    client_shallow: &HashSet<ObjectId>,
    odb: &O,
) -> Result<ShallowUpdate> {
    let mut update = ShallowUpdate::default();
    let mut included = HashSet::new();
    let mut queue: VecDeque<ObjectId> = wants.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        if !included.insert(id) {
            continue;
        }
        let Some(info) = odb.info(&id)? else { continue };
        if info.kind != ObjectKind::Commit {
            continue;
        }
        let parents: Vec<ObjectId> = info.parents().collect();
        if parents.is_empty() {
            continue;
        }
        let mut cut = false;
        for parent in &parents {
            let old_enough = match odb.info(parent)? {
                Some(p) if p.kind == ObjectKind::Commit => p.commit_time < since,
                _ => false,
            };
            if old_enough {
                cut = true;
            } else {
                queue.push_back(*parent);
            }
        }
        if cut {
            update.shallow.push(id);
        } else if client_shallow.contains(&id) {
            update.unshallow.push(id);
        }
    }
    Ok(update)
}

/// Exclude history reachable from the named refs; commits with an excluded
/// parent become the new boundary.
fn by_exclusion<O: ObjectDatabase, R: RefDatabase + ?Sized>(
    not: &[String],
    wants: &[ObjectId],
    client_shallow: &HashSet<ObjectId>,
    odb: &O,
    refs: &R,
) -> Result<ShallowUpdate> {
    let mut excluded = HashSet::new();
    for name in not {
        let Some(record) = refs.find(name)? else { continue };
        let Some(tip) = record.object_id() else { continue };
        let mut queue = VecDeque::from([tip]);
        while let Some(id) = queue.pop_front() {
            if !excluded.insert(id) {
                continue;
            }
            queue.extend(commit_parents(odb, id)?);
        }
    }

    let mut update = ShallowUpdate::default();
    let mut visited = HashSet::new();
    let mut queue: VecDeque<ObjectId> = wants.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if excluded.contains(&id) || !visited.insert(id) {
            continue;
        }
        let mut has_excluded_parent = false;
        for parent in commit_parents(odb, id)? {
            if excluded.contains(&parent) {
                has_excluded_parent = true;
            } else {
                queue.push_back(parent);
            }
        }
        if has_excluded_parent {
            update.shallow.push(id);
        } else if client_shallow.contains(&id) {
            update.unshallow.push(id);
        }
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_serve_core::memory::{InMemoryObjectDatabase, InMemoryRefDatabase};
    use wharf_serve_core::visibility::RefRecord;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes_or_panic(&[byte; 20])
    }

    /// Linear history: c1(t=100) <- c2(t=200) <- c3(t=300) <- c4(t=400)
    fn linear() -> InMemoryObjectDatabase {
        let mut odb = InMemoryObjectDatabase::new();
        odb.insert_commit(oid(1), &[], None, 100);
        odb.insert_commit(oid(2), &[oid(1)], None, 200);
        odb.insert_commit(oid(3), &[oid(2)], None, 300);
        odb.insert_commit(oid(4), &[oid(3)], None, 400);
        odb
    }

    #[test]
    fn depth_cut_marks_boundary() {
        let odb = linear();
        let refs = InMemoryRefDatabase::new();
        let deepen = DeepenSpec {
            depth: 2,
            ..Default::default()
        };
        let update = compute(&deepen, &[oid(4)], &odb, &refs).unwrap();
        assert_eq!(update.shallow, vec![oid(3)]);
        assert!(update.unshallow.is_empty());
    }

    #[test]
    fn depth_past_root_has_no_boundary() {
        let odb = linear();
        let refs = InMemoryRefDatabase::new();
        let deepen = DeepenSpec {
            depth: 10,
            ..Default::default()
        };
        let update = compute(&deepen, &[oid(4)], &odb, &refs).unwrap();
        assert!(update.shallow.is_empty(), "root has no parents to withhold");
    }

    #[test]
    fn deepening_unshallows_previous_boundary() {
        let odb = linear();
        let refs = InMemoryRefDatabase::new();
        let deepen = DeepenSpec {
            depth: 3,
            client_shallow: vec![oid(3)],
            ..Default::default()
        };
        let update = compute(&deepen, &[oid(4)], &odb, &refs).unwrap();
        assert_eq!(update.shallow, vec![oid(2)]);
        assert_eq!(update.unshallow, vec![oid(3)]);
    }

    #[test]
    fn since_cut_respects_commit_times() {
        let odb = linear();
        let refs = InMemoryRefDatabase::new();
        let deepen = DeepenSpec {
            since: 250,
            ..Default::default()
        };
        let update = compute(&deepen, &[oid(4)], &odb, &refs).unwrap();
        // c3 keeps no parents because c2 (t=200) is older than the cut.
        assert_eq!(update.shallow, vec![oid(3)]);
    }

    #[test]
    fn exclusion_cut_stops_at_excluded_history() {
        let odb = linear();
        let mut refs = InMemoryRefDatabase::new();
        refs.insert(RefRecord::new(oid(2), "refs/heads/old"));
        let deepen = DeepenSpec {
            not: vec!["refs/heads/old".into()],
            ..Default::default()
        };
        let update = compute(&deepen, &[oid(4)], &odb, &refs).unwrap();
        assert_eq!(update.shallow, vec![oid(3)]);
    }
}
