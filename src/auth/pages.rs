use std::collections::BTreeMap;

use serde::Serialize;

use super::roles::Role;

const OPEN_PAGES: &[&str] = &["/app/401", "/app/home"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageLink {
    pub href: &'static str,
    pub label: &'static str,
}

#[derive(Debug, Clone)]
pub struct PageTable {
    links: BTreeMap<Role, Vec<PageLink>>,
}

impl PageTable {
    pub fn standard() -> Self {
        let files = PageLink {
            href: "/app/files",
            label: "Files Overview",
        };
        let tasks = PageLink {
            href: "/app/tasks",
            label: "Tasks Overview",
        };
        let links = BTreeMap::from([
            (
                Role::Admin,
                vec![
                    PageLink {
                        href: "/app/users",
                        label: "Users Overview",
                    },
                    PageLink {
                        href: "/app/tags",
                        label: "Tags Overview",
                    },
                ],
            ),
            (
                Role::Maintainer,
                vec![PageLink {
                    href: "/app/images",
                    label: "Images Overview",
                }],
            ),
            (Role::AiResearcher, vec![files, tasks]),
            (Role::DataEngineer, vec![files, tasks]),
        ]);
        Self { links }
    }

    pub fn viewable(&self, roles: &[Role]) -> Vec<PageLink> {
        let mut links: Vec<PageLink> = roles
            .iter()
            .filter_map(|role| self.links.get(role))
            .flatten()
            .copied()
            .collect();
        links.sort_by(|a, b| a.label.cmp(b.label).then(a.href.cmp(b.href)));
        links.dedup();
        links
    }

    pub fn can_visit(&self, roles: &[Role], page: &str) -> bool {
        OPEN_PAGES.contains(&page)
            || roles
                .iter()
                .filter_map(|role| self.links.get(role))
                .flatten()
                .any(|link| page.starts_with(link.href))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_roles_do_not_duplicate_links() {
        let table = PageTable::standard();
        let links = table.viewable(&[Role::DataEngineer, Role::AiResearcher]);
        let labels: Vec<_> = links.iter().map(|link| link.label).collect();
        assert_eq!(labels, vec!["Files Overview", "Tasks Overview"]);
    }

    #[test]
    fn pages_match_by_prefix() {
        let table = PageTable::standard();
        assert!(table.can_visit(&[Role::Maintainer], "/app/images/42"));
        assert!(!table.can_visit(&[Role::Maintainer], "/app/files"));
    }

    #[test]
    fn open_pages_need_no_role() {
        let table = PageTable::standard();
        assert!(table.can_visit(&[], "/app/home"));
        assert!(table.can_visit(&[], "/app/401"));
        assert!(!table.can_visit(&[], "/app/users"));
    }
}
