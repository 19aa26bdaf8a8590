//! Authorization: which hosts a gateway user may reach.
//!
//! username -> groups containing it -> permissions naming one of those
//! groups -> union of their host patterns -> hosts whose name matches.

use crate::policy::{Group, Host, Permission, PolicyStore};

/// Groups that list `username` as a member.
pub fn user_groups<'a>(store: &'a PolicyStore, username: &str) -> Vec<&'a Group> {
    store
        .groups()
        .iter()
        .filter(|g| g.contains(username))
        .collect()
}

/// Permissions that apply to at least one of `groups`.
fn applicable_permissions<'a>(
    store: &'a PolicyStore,
    groups: &[&Group],
) -> impl Iterator<Item = &'a Permission> {
    let names: Vec<String> = groups.iter().map(|g| g.name.clone()).collect();
    store
        .permissions()
        .iter()
        .filter(move |p| names.iter().any(|n| p.applies_to(n)))
}

/// Hosts `username` may reach, in policy order.
///
/// A user in no group gets an empty list.
pub fn reachable_hosts<'a>(store: &'a PolicyStore, username: &str) -> Vec<&'a Host> {
    let groups = user_groups(store, username);
    if groups.is_empty() {
        return Vec::new();
    }

    let patterns: Vec<_> = applicable_permissions(store, &groups)
        .flat_map(|p| p.patterns().iter())
        .collect();

    store
        .hosts()
        .iter()
        .filter(|h| patterns.iter().any(|p| p.is_match(&h.name)))
        .collect()
}

/// Whether some permission naming `group` grants `host`.
pub fn can_group_access(store: &PolicyStore, group: &Group, host: &Host) -> bool {
    store
        .permissions()
        .iter()
        .any(|p| p.applies_to(&group.name) && p.matches(&host.name))
}

/// Whether `username` may reach `host` through any of their groups.
pub fn can_user_access(store: &PolicyStore, username: &str, host: &Host) -> bool {
    user_groups(store, username)
        .into_iter()
        .any(|g| can_group_access(store, g, host))
}
