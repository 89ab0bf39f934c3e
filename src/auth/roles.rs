use std::fmt;

use diesel::prelude::*;
use serde::{Serialize, Serializer};

use crate::models::NewRole;
use crate::schema::{roles, users_roles};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Admin,
    DataEngineer,
    AiResearcher,
    Maintainer,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Admin,
        Role::DataEngineer,
        Role::AiResearcher,
        Role::Maintainer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::DataEngineer => "Data Engineer",
            Role::AiResearcher => "AI Researcher",
            Role::Maintainer => "Maintainer",
        }
    }

    pub fn from_name(name: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|role| role.name() == name)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

pub fn reseed_roles(conn: &mut PgConnection) -> QueryResult<()> {
    let names: Vec<&str> = Role::ALL.iter().map(|role| role.name()).collect();
    conn.transaction(|conn| {
        diesel::delete(roles::table.filter(roles::name.ne_all(&names))).execute(conn)?;
        let rows: Vec<NewRole> = names.iter().map(|name| NewRole { name }).collect();
        diesel::insert_into(roles::table)
            .values(&rows)
            .on_conflict(roles::name)
            .do_nothing()
            .execute(conn)?;
        Ok(())
    })
}

pub fn roles_for_user(conn: &mut PgConnection, user_id: i32) -> QueryResult<Vec<Role>> {
    let names: Vec<String> = users_roles::table
        .inner_join(roles::table)
        .filter(users_roles::user_id.eq(user_id))
        .select(roles::name)
        .load(conn)?;
    let mut held: Vec<Role> = names.iter().filter_map(|name| Role::from_name(name)).collect();
    held.sort();
    held.dedup();
    Ok(held)
}

#[cfg(test)]
mod tests {
    use super::Role;

    #[test]
    fn names_round_trip_for_every_role() {
        for role in Role::ALL {
            assert_eq!(Role::from_name(role.name()), Some(role));
        }
        assert_eq!(Role::from_name("admin"), None);
    }
}
