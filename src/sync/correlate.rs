//! The join between remote child tasks and local checklist items.
//!
//! The two systems share no stable id, so the item text is the key: exact,
//! case- and whitespace-sensitive, first match wins. Everything that pairs
//! children with checklist items goes through here.

use crate::model::priority::ChecklistItem;
use crate::model::work_item::RemoteWorkItem;

pub fn find_by_text(checklist: &[ChecklistItem], text: &str) -> Option<usize> {
    checklist.iter().position(|item| item.text == text)
}

pub fn match_checklist_item(checklist: &[ChecklistItem], child: &RemoteWorkItem) -> Option<usize> {
    find_by_text(checklist, &child.title)
}
