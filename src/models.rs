use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde_json::Value;

use crate::schema::*;

pub const TAG_KIND_USER: &str = "user";
pub const TAG_KIND_CUSTOM: &str = "custom";

pub const FILE_KIND_FILE: &str = "file";
pub const FILE_KIND_DIRECTORY: &str = "directory";

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub email: String,
    pub password_hash: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, PartialEq, Eq)]
#[diesel(table_name = roles)]
pub struct RoleRow {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = roles)]
pub struct NewRole<'a> {
    pub name: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users_roles)]
pub struct NewUserRole {
    pub user_id: i32,
    pub role_id: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sessions)]
#[diesel(belongs_to(User))]
pub struct Session {
    pub id: i32,
    pub token_hash: String,
    pub user_id: i32,
    pub expires_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSession {
    pub token_hash: String,
    pub user_id: i32,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, PartialEq, Eq)]
#[diesel(table_name = tags)]
pub struct Tag {
    pub id: i32,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tags)]
pub struct NewTag<'a> {
    pub name: &'a str,
    pub kind: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = tasks)]
pub struct Task {
    pub id: i32,
    pub token_id: String,
    pub name: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTask<'a> {
    pub token_id: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tasks_tags)]
pub struct NewTaskTag {
    pub task_id: i32,
    pub tag_id: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = files)]
pub struct File {
    pub id: i32,
    pub index: String,
    pub kind: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = files)]
pub struct NewFile<'a> {
    pub index: &'a str,
    pub kind: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = files_tags)]
pub struct NewFileTag {
    pub file_id: i32,
    pub tag_id: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = images)]
pub struct Image {
    pub id: i32,
    pub name: String,
    pub container_path: String,
    pub parameters: Value,
}

impl Image {
    pub fn parameter_names(&self) -> Vec<String> {
        match &self.parameters {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = images)]
pub struct NewImage<'a> {
    pub name: &'a str,
    pub container_path: &'a str,
    pub parameters: Value,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = images_roles)]
pub struct NewImageRole {
    pub image_id: i32,
    pub role_id: i32,
}
