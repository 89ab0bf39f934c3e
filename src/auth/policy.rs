use std::collections::{HashMap, HashSet};

use super::roles::Role;

pub const TASKS_PREFIX: &str = "/api/tasks/";

const EXCLUDED_ROUTES: &[&str] = &[
    "/api/auth/register",
    "/api/auth/login",
    "/api/health",
    "/api/auth/logout",
    "/api/users/roles",
    "/api/auth/viewable_pages",
    "/api/auth/user_authorized",
    "/api/users/email",
    "/api/users/current",
];

pub const APPLICATION_ROUTES: &[&str] = &[
    "/api/health",
    "/api/auth/register",
    "/api/auth/login",
    "/api/auth/logout",
    "/api/auth/viewable_pages",
    "/api/auth/user_authorized",
    "/api/users/admin",
    "/api/users/current",
    "/api/users/email",
    "/api/users/roles",
    "/api/roles",
    "/api/roles/admin",
    "/api/tags",
    "/api/tags/admin",
    "/api/images",
    "/api/images/stored_parameters",
    "/api/files",
    "/api/files/upload",
    "/api/tasks",
];

const ADMIN_PATHS: &[&str] = &[
    "/api/users/admin",
    "/api/roles/admin",
    "/api/tags/admin",
    "/api/roles",
];

const DATA_ENGINEER_PATHS: &[&str] = &[
    "/api/tasks",
    "/api/tasks/",
    "/api/tags",
    "/api/images",
    "/api/images/stored_parameters",
    "/api/files",
    "/api/files/upload",
    "/api/files/download",
];

const AI_RESEARCHER_PATHS: &[&str] = &[
    "/api/tasks",
    "/api/tasks/",
    "/api/tags",
    "/api/images",
    "/api/images/stored_parameters",
    "/api/files",
    "/api/files/upload",
];

const MAINTAINER_PATHS: &[&str] = &["/api/images", "/api/roles"];

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    role_paths: HashMap<Role, HashSet<&'static str>>,
    excluded: HashSet<&'static str>,
    routes: HashSet<&'static str>,
}

impl AccessPolicy {
    pub fn new(
        role_paths: HashMap<Role, HashSet<&'static str>>,
        excluded: HashSet<&'static str>,
        routes: HashSet<&'static str>,
    ) -> Self {
        Self {
            role_paths,
            excluded,
            routes,
        }
    }

    pub fn standard() -> Self {
        let role_paths = Role::ALL
            .into_iter()
            .map(|role| {
                let paths = match role {
                    Role::Admin => ADMIN_PATHS,
                    Role::DataEngineer => DATA_ENGINEER_PATHS,
                    Role::AiResearcher => AI_RESEARCHER_PATHS,
                    Role::Maintainer => MAINTAINER_PATHS,
                };
                (role, paths.iter().copied().collect())
            })
            .collect();
        Self::new(
            role_paths,
            EXCLUDED_ROUTES.iter().copied().collect(),
            APPLICATION_ROUTES.iter().copied().collect(),
        )
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded.contains(path)
    }

    pub fn is_registered_route(&self, path: &str) -> bool {
        self.routes.contains(path)
    }

    pub fn role_authorized(&self, roles: &[Role], path: &str) -> bool {
        roles.iter().any(|role| {
            self.role_paths
                .get(role)
                .is_some_and(|paths| paths.contains(path))
        })
    }
}

pub fn task_token(path: &str) -> Option<&str> {
    let token = path.strip_prefix(TASKS_PREFIX)?;
    let valid = !token.is_empty()
        && token
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_');
    valid.then_some(token)
}
