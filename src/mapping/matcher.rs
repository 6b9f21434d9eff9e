use crate::storage::local::LocalMember;
use crate::storage::repository::ExternalMember;

/// Picks the local member an external member should map to.
///
/// Implementations see every active local member and return the id of the
/// chosen one, or `None` to leave the external member unmapped.
pub trait MemberMatcher: Send + Sync {
    fn find_match(&self, external: &ExternalMember, candidates: &[LocalMember]) -> Option<i64>;
}

/// E-mail first, then full name, then first name, then last name. All
/// comparisons are case-insensitive and ignore surrounding whitespace; the
/// first candidate (lowest id) wins at each stage.
///
/// The first- and last-name stages can map homonyms to the wrong person.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailThenNameMatcher;

fn norm(s: &str) -> String {
    s.trim().to_lowercase()
}

fn same(a: Option<&str>, b: &str) -> bool {
    match a {
        Some(a) => !a.trim().is_empty() && norm(a) == b,
        None => false,
    }
}

impl MemberMatcher for EmailThenNameMatcher {
    fn find_match(&self, external: &ExternalMember, candidates: &[LocalMember]) -> Option<i64> {
        let email = norm(&external.email);
        if !email.is_empty() {
            if let Some(m) = candidates.iter().find(|m| same(m.email.as_deref(), &email)) {
                return Some(m.member_id);
            }
        }

        let name = norm(&external.name);
        if name.is_empty() {
            return None;
        }

        candidates
            .iter()
            .find(|m| norm(&m.full_name()) == name)
            .or_else(|| candidates.iter().find(|m| same(m.first_name.as_deref(), &name)))
            .or_else(|| candidates.iter().find(|m| same(m.last_name.as_deref(), &name)))
            .map(|m| m.member_id)
    }
}
