//! Distributor (spec §4.C). Groups probed descriptors by album, splits
//! oversized albums, and assigns whole groups to sessions under a
//! lowest-load-first policy.
//!
//! Grounded on `MediaGroupAwareStrategy._group_messages`/`_find_min_load_client`.

use crate::domain::{Assignment, BalanceReport, Group, MessageDescriptor};
use crate::shared::config::DistributionMetric;
use std::collections::BTreeMap;
use tracing::info;

pub struct DistributorConfig {
    pub metric: DistributionMetric,
    pub prefer_large_groups_first: bool,
    /// `2 × session_count` (spec §3, §6).
    pub oversized_threshold: usize,
    pub session_count: usize,
}

/// Builds groups from probed descriptors: one group per `album_id`, a
/// synthetic `single:<id>` group per non-album message, splitting any
/// album whose member count exceeds `oversized_threshold` (spec §3, §4.C).
pub fn build_groups(descriptors: Vec<MessageDescriptor>, cfg: &DistributorConfig) -> Vec<Group> {
    let mut albums: BTreeMap<String, Vec<MessageDescriptor>> = BTreeMap::new();
    let mut singles = Vec::new();

    for desc in descriptors {
        match &desc.album_id {
            Some(album_id) => albums.entry(album_id.clone()).or_default().push(desc),
            None => singles.push(desc),
        }
    }

    let mut groups = Vec::new();
    for (album_id, mut members) in albums {
        members.sort_by_key(|m| m.id);
        if members.len() > cfg.oversized_threshold {
            info!(
                album_id,
                members = members.len(),
                threshold = cfg.oversized_threshold,
                "splitting oversized album"
            );
            let chunk_size = (members.len() / cfg.session_count.max(1)).max(2);
            for (i, chunk) in members.chunks(chunk_size).enumerate() {
                groups.push(Group {
                    group_id: format!("{album_id}_part_{}", i + 1),
                    members: chunk.to_vec(),
                    is_album: true,
                });
            }
        } else {
            groups.push(Group {
                group_id: album_id,
                members,
                is_album: true,
            });
        }
    }

    for desc in singles {
        groups.push(Group {
            group_id: format!("single:{}", desc.id),
            is_album: false,
            members: vec![desc],
        });
    }

    groups
}

/// Assigns groups to sessions with a greedy lowest-load-first policy (spec
/// §4.C). `session_names` order is significant: it's the tie-break order
/// and determines the assignment's output order.
pub fn distribute(
    mut groups: Vec<Group>,
    session_names: &[String],
    cfg: &DistributorConfig,
) -> (Assignment, BalanceReport) {
    let mut per_session: Vec<(String, Vec<Group>)> =
        session_names.iter().map(|n| (n.clone(), Vec::new())).collect();

    if per_session.is_empty() {
        return (Assignment::default(), BalanceReport::default());
    }

    if cfg.prefer_large_groups_first {
        groups.sort_by(|a, b| b.file_count().cmp(&a.file_count()));
    }

    let mut loads = vec![0.0_f64; per_session.len()];
    for group in groups {
        let idx = min_load_index(&loads);
        loads[idx] += load_contribution(&group, cfg.metric);
        per_session[idx].1.push(group);
    }

    let file_counts: Vec<(String, usize)> = per_session
        .iter()
        .map(|(name, groups)| (name.clone(), groups.iter().map(|g| g.file_count()).sum()))
        .collect();
    let counts: Vec<usize> = file_counts.iter().map(|(_, c)| *c).collect();
    let min = counts.iter().copied().min().unwrap_or(0);
    let max = counts.iter().copied().max().unwrap_or(0);
    let mean = if counts.is_empty() {
        0.0
    } else {
        counts.iter().sum::<usize>() as f64 / counts.len() as f64
    };

    let report = BalanceReport {
        per_session_file_counts: file_counts,
        min,
        max,
        mean,
    };
    info!(min = report.min, max = report.max, mean = report.mean, "distribution balanced");

    (Assignment { per_session }, report)
}

fn min_load_index(loads: &[f64]) -> usize {
    loads
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn load_contribution(group: &Group, metric: DistributionMetric) -> f64 {
    const MIB: f64 = 1024.0 * 1024.0;
    match metric {
        DistributionMetric::FileCount => group.file_count() as f64,
        DistributionMetric::MessageCount => group.message_count() as f64,
        DistributionMetric::SizeEstimate => group.estimated_size() as f64,
        DistributionMetric::Mixed => {
            group.file_count() as f64 * 0.6 + (group.estimated_size() as f64 / MIB) * 0.4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageKind;

    fn photo(id: i32, album: Option<&str>) -> MessageDescriptor {
        MessageDescriptor {
            id,
            album_id: album.map(|s| s.to_string()),
            kind: MessageKind::Photo,
            size_estimate: MessageKind::Photo.default_size_estimate(),
            caption: None,
            source_filename: None,
            mime_type: None,
            date: 0,
            text: String::new(),
        }
    }

    fn cfg(session_count: usize) -> DistributorConfig {
        DistributorConfig {
            metric: DistributionMetric::FileCount,
            prefer_large_groups_first: true,
            oversized_threshold: 2 * session_count,
            session_count,
        }
    }

    #[test]
    fn groups_album_members_together_and_singles_separately() {
        let descs = vec![
            photo(1, Some("A1")),
            photo(2, Some("A1")),
            photo(3, None),
        ];
        let groups = build_groups(descs, &cfg(2));
        assert_eq!(groups.len(), 2);
        let album = groups.iter().find(|g| g.is_album).unwrap();
        assert_eq!(album.members.len(), 2);
        let single = groups.iter().find(|g| !g.is_album).unwrap();
        assert_eq!(single.group_id, "single:3");
    }

    #[test]
    fn splits_oversized_album_preserving_album_id() {
        let descs: Vec<_> = (1..=22).map(|i| photo(i, Some("A1"))).collect();
        let groups = build_groups(descs, &cfg(3));
        // threshold = 6, 22 members > 6, chunk = max(2, 22/3) = 7 -> 4 chunks (7,7,7,1)
        assert!(groups.len() > 1);
        assert!(groups.iter().all(|g| g.group_id.starts_with("A1_part_")));
        assert!(groups.iter().all(|g| g.is_album));
        let total: usize = groups.iter().map(|g| g.members.len()).sum();
        assert_eq!(total, 22);
    }

    #[test]
    fn every_valid_id_assigned_exactly_once() {
        let descs: Vec<_> = (1..=10).map(|i| photo(i, None)).collect();
        let groups = build_groups(descs, &cfg(3));
        let sessions = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        let (assignment, _) = distribute(groups, &sessions, &cfg(3));
        assert_eq!(assignment.total_valid_ids(), 10);
    }

    #[test]
    fn album_lands_on_a_single_session() {
        let descs = vec![
            photo(1, Some("A1")),
            photo(2, Some("A1")),
            photo(3, Some("A1")),
        ];
        let groups = build_groups(descs, &cfg(2));
        let sessions = vec!["s1".to_string(), "s2".to_string()];
        let (assignment, _) = distribute(groups, &sessions, &cfg(2));
        let sessions_with_album: Vec<_> = assignment
            .per_session
            .iter()
            .filter(|(_, groups)| groups.iter().any(|g| g.album_id() == Some("A1")))
            .collect();
        assert_eq!(sessions_with_album.len(), 1);
    }

    #[test]
    fn empty_input_yields_empty_assignment() {
        let sessions = vec!["s1".to_string()];
        let (assignment, report) = distribute(vec![], &sessions, &cfg(1));
        assert_eq!(assignment.total_groups(), 0);
        assert_eq!(report.min, 0);
    }

    #[test]
    fn single_session_receives_all_groups() {
        let descs: Vec<_> = (1..=5).map(|i| photo(i, None)).collect();
        let groups = build_groups(descs, &cfg(1));
        let sessions = vec!["only".to_string()];
        let (assignment, _) = distribute(groups, &sessions, &cfg(1));
        assert_eq!(assignment.groups_for("only").unwrap().len(), 5);
    }

    #[test]
    fn fewer_groups_than_sessions_leaves_some_empty() {
        let descs = vec![photo(1, None)];
        let groups = build_groups(descs, &cfg(3));
        let sessions = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        let (assignment, _) = distribute(groups, &sessions, &cfg(3));
        let empty_count = assignment
            .per_session
            .iter()
            .filter(|(_, g)| g.is_empty())
            .count();
        assert_eq!(empty_count, 2);
    }
}
