//! Media-Group Grouper: folds a flat, id-ordered message list into a
//! sequence of [`AtomicUnit`]s.

use crate::model::{AtomicUnit, MediaGroup, Message, MEDIA_GROUP_CAP};

/// Fold `messages` (assumed already in source-id order) into atomic units.
/// Consecutive messages sharing a non-empty `group_id` fold into one
/// `Group`; a boundary is declared when the group-id changes, becomes
/// empty, or the group reaches [`MEDIA_GROUP_CAP`].
pub fn group(messages: Vec<Message>) -> Vec<AtomicUnit> {
    let mut units = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_group_id: Option<String> = None;

    for message in messages {
        match (&current_group_id, &message.group_id) {
            (Some(gid), Some(next_gid)) if gid == next_gid && current.len() < MEDIA_GROUP_CAP => {
                current.push(message);
            }
            _ => {
                flush(&mut current, &mut current_group_id, &mut units);
                current_group_id = message.group_id.clone();
                current.push(message);
            }
        }
    }
    flush(&mut current, &mut current_group_id, &mut units);

    units
}

fn flush(current: &mut Vec<Message>, group_id: &mut Option<String>, units: &mut Vec<AtomicUnit>) {
    if current.is_empty() {
        return;
    }
    let messages = std::mem::take(current);
    match group_id.take() {
        Some(gid) if !gid.is_empty() => units.push(AtomicUnit::Group(MediaGroup::new(gid, messages))),
        _ => units.extend(messages.into_iter().map(AtomicUnit::Singleton)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaKind;

    fn msg(id: i64, group_id: Option<&str>) -> Message {
        Message {
            channel_id: 1,
            message_id: id,
            author_date: chrono::Utc::now(),
            text: None,
            caption: None,
            media_payload_ref: None,
            group_id: group_id.map(|s| s.to_string()),
            media_kind: MediaKind::Photo,
            file_size: 1,
            file_name: None,
        }
    }

    #[test]
    fn ungrouped_messages_become_singletons() {
        let units = group(vec![msg(100, None), msg(101, None)]);
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| matches!(u, AtomicUnit::Singleton(_))));
    }

    #[test]
    fn consecutive_same_group_id_folds_into_one_group() {
        let units = group(vec![
            msg(100, None),
            msg(101, Some("g1")),
            msg(102, Some("g1")),
            msg(103, Some("g1")),
            msg(104, None),
        ]);
        assert_eq!(units.len(), 3);
        match &units[1] {
            AtomicUnit::Group(g) => assert_eq!(g.len(), 3),
            _ => panic!("expected a group"),
        }
    }

    #[test]
    fn group_boundary_on_group_id_change() {
        let units = group(vec![
            msg(100, Some("g1")),
            msg(101, Some("g1")),
            msg(102, Some("g2")),
        ]);
        assert_eq!(units.len(), 2);
        match (&units[0], &units[1]) {
            (AtomicUnit::Group(a), AtomicUnit::Group(b)) => {
                assert_eq!(a.len(), 2);
                assert_eq!(b.len(), 1);
            }
            _ => panic!("expected two groups"),
        }
    }

    #[test]
    fn group_boundary_on_cap_exceeded() {
        let messages: Vec<Message> = (0..12).map(|i| msg(100 + i, Some("g1"))).collect();
        let units = group(messages);
        assert_eq!(units.len(), 2);
        match (&units[0], &units[1]) {
            (AtomicUnit::Group(a), AtomicUnit::Group(b)) => {
                assert_eq!(a.len(), MEDIA_GROUP_CAP);
                assert_eq!(b.len(), 2);
            }
            _ => panic!("expected two groups"),
        }
    }

    #[test]
    fn preserves_source_order() {
        let units = group(vec![msg(100, None), msg(101, Some("g1")), msg(102, Some("g1"))]);
        assert_eq!(units[0].source_id(), 100);
        assert_eq!(units[1].source_id(), 101);
    }

    #[test]
    fn empty_input_yields_no_units() {
        assert!(group(Vec::new()).is_empty());
    }
}
