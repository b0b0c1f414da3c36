//! Pure merge functions: one event applied to one cached collection.
//!
//! Each function takes the current snapshot (`None` when the collection has not
//! been fetched yet) and returns a new list, `Unchanged`, or `Deferred` when the
//! event cannot be applied yet and must stay queued. Inputs are never mutated.

use crate::event::{MessageInfo, Part, SessionInfo, SessionMessage};

/// Outcome of applying one event to one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled<T> {
    /// The event produced a new snapshot.
    Applied(T),
    /// The event was understood but changes nothing; no write is needed.
    Unchanged,
    /// The target is not present yet; keep the event for a later pass.
    Deferred,
}

impl<T> Reconciled<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Reconciled::Deferred)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    Created,
    Updated,
}

/// Merge a `session.created` / `session.updated` payload into the session list.
///
/// Created sessions go to the front (newest first). A created session whose id
/// is already listed (e.g. it came in with the initial fetch) is replaced in
/// place so ids stay unique. Updates for unknown ids are ignored.
pub fn upsert_session(
    sessions: Option<&[SessionInfo]>,
    change: SessionChange,
    info: &SessionInfo,
) -> Reconciled<Vec<SessionInfo>> {
    let Some(sessions) = sessions else {
        return Reconciled::Deferred;
    };

    if let Some(i) = sessions.iter().position(|s| s.id == info.id) {
        if sessions[i] == *info {
            return Reconciled::Unchanged;
        }
        let mut next = sessions.to_vec();
        next[i] = info.clone();
        return Reconciled::Applied(next);
    }

    match change {
        SessionChange::Created => {
            let mut next = Vec::with_capacity(sessions.len() + 1);
            next.push(info.clone());
            next.extend_from_slice(sessions);
            Reconciled::Applied(next)
        }
        SessionChange::Updated => Reconciled::Unchanged,
    }
}

/// Merge a `message.updated` payload into a session's message list.
///
/// Known ids get their header replaced and keep their parts. New messages are
/// inserted before the first message created strictly later, so equal
/// timestamps keep arrival order.
pub fn upsert_message(
    messages: Option<&[SessionMessage]>,
    info: &MessageInfo,
) -> Reconciled<Vec<SessionMessage>> {
    let Some(messages) = messages else {
        return Reconciled::Deferred;
    };

    if let Some(i) = messages.iter().position(|m| m.info.id == info.id) {
        if messages[i].info == *info {
            return Reconciled::Unchanged;
        }
        let mut next = messages.to_vec();
        next[i].info = info.clone();
        return Reconciled::Applied(next);
    }

    let at = messages
        .iter()
        .position(|m| m.info.time.created > info.time.created)
        .unwrap_or(messages.len());
    let mut next = messages.to_vec();
    next.insert(
        at,
        SessionMessage {
            info: info.clone(),
            parts: Vec::new(),
        },
    );
    Reconciled::Applied(next)
}

/// Placement key for a part: its start time, or +inf when it has none.
fn start_rank(part: &Part) -> f64 {
    part.start().unwrap_or(f64::INFINITY)
}

/// Merge a `message.part.updated` payload into its owning message.
///
/// Returns `Deferred` when the owning message is not cached yet (parts can
/// arrive before their message). Known part ids are replaced in place; new
/// parts go before the first part that starts strictly later.
pub fn upsert_message_part(
    messages: Option<&[SessionMessage]>,
    part: &Part,
) -> Reconciled<Vec<SessionMessage>> {
    let Some(messages) = messages else {
        return Reconciled::Deferred;
    };
    let Some(owner) = messages.iter().position(|m| m.info.id == part.message_id) else {
        return Reconciled::Deferred;
    };

    let parts = &messages[owner].parts;
    let mut next_parts = parts.clone();
    match parts.iter().position(|p| p.id == part.id) {
        Some(i) if parts[i] == *part => return Reconciled::Unchanged,
        Some(i) => next_parts[i] = part.clone(),
        None => {
            let rank = start_rank(part);
            let at = parts
                .iter()
                .position(|p| start_rank(p) > rank)
                .unwrap_or(parts.len());
            next_parts.insert(at, part.clone());
        }
    }

    let mut next = messages.to_vec();
    next[owner].parts = next_parts;
    Reconciled::Applied(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MessageTime, PartTime, Role, SessionTime};
    use serde_json::{Map, Value};

    fn session(id: &str, title: &str) -> SessionInfo {
        SessionInfo {
            id: id.into(),
            title: title.into(),
            directory: "/work".into(),
            parent_id: None,
            share: None,
            time: SessionTime {
                created: 1.0,
                updated: 1.0,
            },
            extra: Map::new(),
        }
    }

    fn message(id: &str, created: f64) -> MessageInfo {
        MessageInfo {
            id: id.into(),
            session_id: "s1".into(),
            role: Role::User,
            time: MessageTime {
                created,
                completed: None,
            },
            mode: None,
            model_id: None,
            provider_id: None,
            extra: Map::new(),
        }
    }

    fn part(id: &str, message_id: &str, start: Option<f64>, text: &str) -> Part {
        let mut extra = Map::new();
        extra.insert("text".into(), Value::String(text.into()));
        Part {
            id: id.into(),
            session_id: "s1".into(),
            message_id: message_id.into(),
            kind: "text".into(),
            time: start.map(|s| PartTime {
                start: Some(s),
                end: None,
            }),
            extra,
        }
    }

    fn applied<T: std::fmt::Debug>(r: Reconciled<T>) -> T {
        match r {
            Reconciled::Applied(v) => v,
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    fn ids(messages: &[SessionMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.info.id.as_str()).collect()
    }

    fn part_ids(message: &SessionMessage) -> Vec<&str> {
        message.parts.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn created_session_is_prepended() {
        let list = vec![session("a", "A")];
        let next = applied(upsert_session(
            Some(&list),
            SessionChange::Created,
            &session("b", "B"),
        ));
        assert_eq!(next.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), ["b", "a"]);
    }

    #[test]
    fn created_session_already_listed_is_replaced_not_duplicated() {
        let list = vec![session("a", "A"), session("b", "B")];
        let next = applied(upsert_session(
            Some(&list),
            SessionChange::Created,
            &session("b", "B2"),
        ));
        assert_eq!(next.len(), 2);
        assert_eq!(next[1].title, "B2");
    }

    #[test]
    fn updated_session_keeps_its_index() {
        let list = vec![session("a", "A"), session("b", "B"), session("c", "C")];
        let next = applied(upsert_session(
            Some(&list),
            SessionChange::Updated,
            &session("b", "renamed"),
        ));
        assert_eq!(next[1].id, "b");
        assert_eq!(next[1].title, "renamed");
        assert_eq!(next.len(), 3);
    }

    #[test]
    fn update_for_unknown_session_is_a_no_op() {
        let empty: Vec<SessionInfo> = Vec::new();
        assert_eq!(
            upsert_session(Some(&empty), SessionChange::Updated, &session("x", "X")),
            Reconciled::Unchanged
        );
        let list = vec![session("a", "A")];
        assert_eq!(
            upsert_session(Some(&list), SessionChange::Updated, &session("x", "X")),
            Reconciled::Unchanged
        );
    }

    #[test]
    fn session_events_defer_until_list_is_fetched() {
        assert!(upsert_session(None, SessionChange::Created, &session("a", "A")).is_deferred());
    }

    #[test]
    fn message_upsert_is_idempotent() {
        let start = vec![SessionMessage {
            info: message("m0", 50.0),
            parts: vec![],
        }];
        let once = applied(upsert_message(Some(&start), &message("m1", 100.0)));
        let twice = match upsert_message(Some(&once), &message("m1", 100.0)) {
            Reconciled::Applied(v) => v,
            Reconciled::Unchanged => once.clone(),
            Reconciled::Deferred => panic!("unexpected deferral"),
        };
        assert_eq!(once, twice);
        assert_eq!(ids(&twice), ["m0", "m1"]);
    }

    #[test]
    fn message_is_inserted_by_creation_time() {
        let list: Vec<SessionMessage> = [("m1", 10.0), ("m2", 20.0), ("m3", 30.0)]
            .into_iter()
            .map(|(id, t)| SessionMessage {
                info: message(id, t),
                parts: vec![],
            })
            .collect();
        let next = applied(upsert_message(Some(&list), &message("mx", 15.0)));
        assert_eq!(ids(&next), ["m1", "mx", "m2", "m3"]);

        let next = applied(upsert_message(Some(&list), &message("late", 99.0)));
        assert_eq!(ids(&next), ["m1", "m2", "m3", "late"]);

        let next = applied(upsert_message(Some(&list), &message("tie", 20.0)));
        assert_eq!(ids(&next), ["m1", "m2", "tie", "m3"]);
    }

    #[test]
    fn message_update_keeps_parts() {
        let list = vec![SessionMessage {
            info: message("m1", 10.0),
            parts: vec![part("p1", "m1", Some(1.0), "hi")],
        }];
        let mut info = message("m1", 10.0);
        info.mode = Some("build".into());
        let next = applied(upsert_message(Some(&list), &info));
        assert_eq!(next[0].info.mode.as_deref(), Some("build"));
        assert_eq!(part_ids(&next[0]), ["p1"]);
    }

    #[test]
    fn part_for_unknown_message_defers_then_applies() {
        let p = part("p1", "m1", Some(100.0), "hello");
        let empty: Vec<SessionMessage> = Vec::new();
        assert!(upsert_message_part(Some(&empty), &p).is_deferred());
        assert!(upsert_message_part(None, &p).is_deferred());

        let with_message = applied(upsert_message(Some(&empty), &message("m1", 100.0)));
        let next = applied(upsert_message_part(Some(&with_message), &p));
        assert_eq!(part_ids(&next[0]), ["p1"]);
    }

    #[test]
    fn same_part_id_is_replaced() {
        let list = vec![SessionMessage {
            info: message("m1", 10.0),
            parts: vec![],
        }];
        let first = applied(upsert_message_part(Some(&list), &part("p1", "m1", Some(1.0), "a")));
        let second = applied(upsert_message_part(
            Some(&first),
            &part("p1", "m1", Some(1.0), "ab"),
        ));
        assert_eq!(second[0].parts.len(), 1);
        assert_eq!(second[0].parts[0].text(), Some("ab"));
    }

    #[test]
    fn parts_are_ordered_by_start_with_missing_start_last() {
        let list = vec![SessionMessage {
            info: message("m1", 10.0),
            parts: vec![
                part("a", "m1", Some(1.0), ""),
                part("c", "m1", Some(3.0), ""),
                part("none", "m1", None, ""),
            ],
        }];
        let next = applied(upsert_message_part(Some(&list), &part("b", "m1", Some(2.0), "")));
        assert_eq!(part_ids(&next[0]), ["a", "b", "c", "none"]);

        let next = applied(upsert_message_part(Some(&next), &part("none2", "m1", None, "")));
        assert_eq!(part_ids(&next[0]), ["a", "b", "c", "none", "none2"]);

        let next = applied(upsert_message_part(Some(&next), &part("c2", "m1", Some(3.0), "")));
        assert_eq!(part_ids(&next[0]), ["a", "b", "c", "c2", "none", "none2"]);
    }

    #[test]
    fn inputs_are_left_untouched() {
        let list = vec![SessionMessage {
            info: message("m1", 10.0),
            parts: vec![],
        }];
        let before = list.clone();
        let _ = upsert_message_part(Some(&list), &part("p1", "m1", None, "x"));
        let _ = upsert_message(Some(&list), &message("m2", 5.0));
        assert_eq!(list, before);
    }
}
