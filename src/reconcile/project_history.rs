use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::graphql::ProjectItemNode;
use crate::window::parse_timestamp;

/// Status recorded when an item is no longer on the target project
pub const REMOVED_STATUS: &str = "__removed__";

/// Key under which the history lives in an issue's raw payload
pub const HISTORY_KEY: &str = "projectStatusHistory";

/// Keys probed on a project field value for its label, in order
const STATUS_LABEL_KEYS: [&str; 5] = ["name", "title", "text", "number", "date"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub project_item_id: String,
    #[serde(default)]
    pub project_title: String,
    pub status: String,
    pub occurred_at: String,
}

impl HistoryEntry {
    pub fn is_removal(&self) -> bool {
        self.status == REMOVED_STATUS
    }

    fn key(&self) -> (&str, &str, &str) {
        (&self.project_item_id, &self.status, &self.occurred_at)
    }
}

/// What the target project looks like for one issue right now
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveMembership {
    /// One snapshot per target-project item that carries a status.
    pub snapshots: Vec<HistoryEntry>,
    /// Every target-project item id, with or without a status.
    pub item_ids: HashSet<String>,
}

impl LiveMembership {
    /// Extract the target project's items from an issue's project memberships.
    ///
    /// `fallback_time` is used as `occurredAt` when neither the field value
    /// nor the item carries an update time.
    pub fn from_items(items: &[ProjectItemNode], target_project: &str, fallback_time: &str) -> Self {
        let target = normalize_title(target_project);
        let mut live = Self::default();

        for item in items {
            let title = item
                .project
                .as_ref()
                .map(|p| p.title.as_str())
                .unwrap_or_default();
            if target.is_empty() || normalize_title(title) != target {
                continue;
            }

            live.item_ids.insert(item.id.clone());

            let Some(status) = item.status.as_ref().and_then(status_label) else {
                continue;
            };

            let occurred_at = item
                .status
                .as_ref()
                .and_then(|v| v.get("updatedAt"))
                .and_then(Value::as_str)
                .or(item.updated_at.as_deref())
                .unwrap_or(fallback_time)
                .to_string();

            live.snapshots.push(HistoryEntry {
                project_item_id: item.id.clone(),
                project_title: title.to_string(),
                status,
                occurred_at,
            });
        }

        live
    }
}

/// Outcome of merging live membership into stored history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryReconciliation {
    pub history: Vec<HistoryEntry>,
    pub removals: usize,
    /// The issue moved onto the target project with this merge.
    pub entered_target: bool,
}

impl HistoryReconciliation {
    /// Fold the merged history back into a raw payload.
    pub fn apply_to(&self, raw: &mut Value) {
        if let Value::Object(map) = raw {
            map.insert(
                HISTORY_KEY.to_string(),
                serde_json::to_value(&self.history).unwrap_or(Value::Array(Vec::new())),
            );
        }
    }
}

fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// First non-empty label on a project field value.
pub fn status_label(value: &Value) -> Option<String> {
    STATUS_LABEL_KEYS.iter().find_map(|key| match value.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// History previously folded into a stored raw payload.
pub fn previous_history(raw: Option<&Value>) -> Vec<HistoryEntry> {
    raw.and_then(|r| r.get(HISTORY_KEY))
        .and_then(|h| serde_json::from_value(h.clone()).ok())
        .unwrap_or_default()
}

/// Sort key for `occurredAt`: parseable times in time order, then the
/// rest lexicographically.
fn occurred_key(at: &str) -> (bool, Option<DateTime<Utc>>, &str) {
    let parsed = parse_timestamp(at);
    (parsed.is_none(), parsed, at)
}

/// Latest entry per project item.
fn latest_by_item(history: &[HistoryEntry]) -> HashMap<&str, &HistoryEntry> {
    let mut latest: HashMap<&str, &HistoryEntry> = HashMap::new();
    for entry in history {
        latest
            .entry(entry.project_item_id.as_str())
            .and_modify(|current| {
                if occurred_key(&entry.occurred_at) >= occurred_key(&current.occurred_at) {
                    *current = entry;
                }
            })
            .or_insert(entry);
    }
    latest
}

/// Merge previous history with live membership.
///
/// Items present before but missing now gain one removal entry stamped
/// with `event_time`. The result is deduplicated on
/// `(projectItemId, status, occurredAt)` and sorted by `occurredAt`, with
/// unparseable times last.
pub fn reconcile(
    previous: &[HistoryEntry],
    live: &LiveMembership,
    event_time: &str,
) -> HistoryReconciliation {
    let latest = latest_by_item(previous);

    let mut removal_entries: Vec<HistoryEntry> = latest
        .values()
        .filter(|entry| !entry.is_removal() && !live.item_ids.contains(&entry.project_item_id))
        .map(|entry| HistoryEntry {
            project_item_id: entry.project_item_id.clone(),
            project_title: entry.project_title.clone(),
            status: REMOVED_STATUS.to_string(),
            occurred_at: event_time.to_string(),
        })
        .collect();
    removal_entries.sort_by(|a, b| a.project_item_id.cmp(&b.project_item_id));

    let was_active = latest.values().any(|entry| !entry.is_removal());
    let known: HashSet<(&str, &str, &str)> = previous.iter().map(HistoryEntry::key).collect();
    let introduces_live = live.snapshots.iter().any(|s| !known.contains(&s.key()));

    let removals = removal_entries.len();
    let mut merged: Vec<HistoryEntry> = Vec::with_capacity(previous.len() + live.snapshots.len() + removals);
    let mut index: HashMap<(String, String, String), usize> = HashMap::new();

    for entry in previous
        .iter()
        .chain(live.snapshots.iter())
        .chain(removal_entries.iter())
    {
        let key = (
            entry.project_item_id.clone(),
            entry.status.clone(),
            entry.occurred_at.clone(),
        );
        match index.get(&key) {
            Some(&at) => {
                if entry.project_title.len() > merged[at].project_title.len() {
                    merged[at].project_title = entry.project_title.clone();
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(entry.clone());
            }
        }
    }

    merged.sort_by(|a, b| occurred_key(&a.occurred_at).cmp(&occurred_key(&b.occurred_at)));

    HistoryReconciliation {
        history: merged,
        removals,
        entered_target: introduces_live && !was_active,
    }
}

/// Time used for synthetic removals: the issue's update time, else now.
pub fn event_time(updated_at: Option<&str>, now: DateTime<Utc>) -> String {
    updated_at
        .filter(|t| parse_timestamp(t).is_some())
        .map(str::to_string)
        .unwrap_or_else(|| crate::model::format_timestamp(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::ProjectRef;
    use serde_json::json;

    fn item(id: &str, project: &str, status: Option<Value>, updated_at: Option<&str>) -> ProjectItemNode {
        ProjectItemNode {
            id: id.to_string(),
            updated_at: updated_at.map(str::to_string),
            project: Some(ProjectRef {
                title: project.to_string(),
            }),
            status,
        }
    }

    fn entry(id: &str, status: &str, at: &str) -> HistoryEntry {
        HistoryEntry {
            project_item_id: id.to_string(),
            project_title: "Roadmap".to_string(),
            status: status.to_string(),
            occurred_at: at.to_string(),
        }
    }

    #[test]
    fn test_status_label_preference() {
        assert_eq!(status_label(&json!({ "name": "In Progress" })).as_deref(), Some("In Progress"));
        assert_eq!(status_label(&json!({ "name": "", "title": "Sprint 4" })).as_deref(), Some("Sprint 4"));
        assert_eq!(status_label(&json!({ "number": 3 })).as_deref(), Some("3"));
        assert_eq!(status_label(&json!({ "date": "2024-02-01" })).as_deref(), Some("2024-02-01"));
        assert_eq!(status_label(&json!({ "__typename": "X" })), None);
    }

    #[test]
    fn test_live_membership_matches_target_case_insensitively() {
        let items = vec![
            item("PVTI_1", " roadmap ", Some(json!({ "name": "Todo", "updatedAt": "2024-01-03T00:00:00Z" })), Some("2024-01-04T00:00:00Z")),
            item("PVTI_2", "Backlog", Some(json!({ "name": "Done" })), None),
            item("PVTI_3", "ROADMAP", None, None),
        ];

        let live = LiveMembership::from_items(&items, "Roadmap", "2024-01-09T00:00:00Z");
        assert_eq!(live.snapshots.len(), 1);
        assert_eq!(live.snapshots[0].status, "Todo");
        assert_eq!(live.snapshots[0].occurred_at, "2024-01-03T00:00:00Z");
        assert!(live.item_ids.contains("PVTI_3"));
        assert!(!live.item_ids.contains("PVTI_2"));

        let none = LiveMembership::from_items(&items, "Other", "2024-01-09T00:00:00Z");
        assert!(none.snapshots.is_empty());
    }

    #[test]
    fn test_occurred_at_falls_back_to_item_then_event() {
        let items = vec![
            item("A", "Roadmap", Some(json!({ "name": "Todo" })), Some("2024-01-04T00:00:00Z")),
            item("B", "Roadmap", Some(json!({ "name": "Todo" })), None),
        ];
        let live = LiveMembership::from_items(&items, "roadmap", "2024-01-09T00:00:00Z");
        assert_eq!(live.snapshots[0].occurred_at, "2024-01-04T00:00:00Z");
        assert_eq!(live.snapshots[1].occurred_at, "2024-01-09T00:00:00Z");
    }

    #[test]
    fn test_missing_item_gets_one_removal() {
        let previous = vec![entry("A", "Todo", "2024-01-01T00:00:00Z")];
        let live = LiveMembership::default();

        let first = reconcile(&previous, &live, "2024-01-05T00:00:00Z");
        assert_eq!(first.removals, 1);
        assert_eq!(first.history.len(), 2);
        assert!(first.history[1].is_removal());
        assert_eq!(first.history[1].project_title, "Roadmap");

        let second = reconcile(&first.history, &live, "2024-01-06T00:00:00Z");
        assert_eq!(second.removals, 0);
        assert_eq!(second.history, first.history);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let previous = vec![
            entry("A", "Todo", "2024-01-01T00:00:00Z"),
            entry("B", "Todo", "2024-01-02T00:00:00Z"),
        ];
        let live = LiveMembership {
            snapshots: vec![entry("A", "Done", "2024-01-03T00:00:00Z")],
            item_ids: ["A".to_string()].into_iter().collect(),
        };

        let once = reconcile(&previous, &live, "2024-01-04T00:00:00Z");
        let twice = reconcile(&once.history, &live, "2024-01-04T00:00:00Z");
        assert_eq!(once.history, twice.history);
        assert_eq!(once.history.len(), 4);
        assert_eq!(twice.removals, 0);
    }

    #[test]
    fn test_duplicate_keeps_richer_title() {
        let mut bare = entry("A", "Todo", "2024-01-01T00:00:00Z");
        bare.project_title.clear();
        let live = LiveMembership {
            snapshots: vec![entry("A", "Todo", "2024-01-01T00:00:00Z")],
            item_ids: ["A".to_string()].into_iter().collect(),
        };

        let merged = reconcile(&[bare], &live, "2024-01-02T00:00:00Z");
        assert_eq!(merged.history.len(), 1);
        assert_eq!(merged.history[0].project_title, "Roadmap");
    }

    #[test]
    fn test_entering_target_project() {
        let live = LiveMembership {
            snapshots: vec![entry("A", "Todo", "2024-01-01T00:00:00Z")],
            item_ids: ["A".to_string()].into_iter().collect(),
        };
        assert!(reconcile(&[], &live, "2024-01-02T00:00:00Z").entered_target);

        let removed = vec![
            entry("A", "Todo", "2023-12-01T00:00:00Z"),
            entry("A", REMOVED_STATUS, "2023-12-02T00:00:00Z"),
        ];
        assert!(reconcile(&removed, &live, "2024-01-02T00:00:00Z").entered_target);

        let active = vec![entry("A", "Todo", "2024-01-01T00:00:00Z")];
        assert!(!reconcile(&active, &live, "2024-01-02T00:00:00Z").entered_target);
    }

    #[test]
    fn test_sort_falls_back_to_lexicographic() {
        let previous = vec![
            entry("A", "Todo", "not-a-date-b"),
            entry("A", "Done", "not-a-date-a"),
        ];
        let live = LiveMembership {
            snapshots: Vec::new(),
            item_ids: ["A".to_string()].into_iter().collect(),
        };
        let merged = reconcile(&previous, &live, "2024-01-01T00:00:00Z");
        assert_eq!(merged.history[0].occurred_at, "not-a-date-a");
    }

    #[test]
    fn test_mixed_timestamps_sort_consistently() {
        let entries = vec![
            entry("A", "Todo", "zzz"),
            entry("B", "Todo", "2024-01-02T00:00:00Z"),
            entry("C", "Todo", "2024-01-01T12:00:00+05:00"),
            entry("D", "Todo", "aaa"),
        ];
        let live = LiveMembership {
            snapshots: Vec::new(),
            item_ids: ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect(),
        };

        let expected = vec!["2024-01-01T12:00:00+05:00", "2024-01-02T00:00:00Z", "aaa", "zzz"];
        let mut reversed = entries.clone();
        reversed.reverse();
        for previous in [entries, reversed] {
            let merged = reconcile(&previous, &live, "2024-01-05T00:00:00Z");
            let order: Vec<&str> = merged.history.iter().map(|e| e.occurred_at.as_str()).collect();
            assert_eq!(order, expected);
        }
    }

    #[test]
    fn test_unparseable_time_orders_after_parseable() {
        let previous = vec![
            entry("A", "Todo", "2024-01-03T00:00:00Z"),
            entry("A", REMOVED_STATUS, "garbage"),
        ];
        let merged = reconcile(&previous, &LiveMembership::default(), "2024-01-05T00:00:00Z");
        assert_eq!(merged.removals, 0);
    }

    #[test]
    fn test_history_round_trips_through_raw() {
        let result = reconcile(
            &[],
            &LiveMembership {
                snapshots: vec![entry("A", "Todo", "2024-01-01T00:00:00Z")],
                item_ids: ["A".to_string()].into_iter().collect(),
            },
            "2024-01-01T00:00:00Z",
        );
        let mut raw = json!({ "id": "I_1" });
        result.apply_to(&mut raw);

        assert_eq!(raw[HISTORY_KEY][0]["projectItemId"], "A");
        assert_eq!(previous_history(Some(&raw)), result.history);
        assert!(previous_history(None).is_empty());
    }
}
