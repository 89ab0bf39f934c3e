use std::collections::HashMap;

use diesel::prelude::*;

use crate::auth::roles::Role;
use crate::models::{File, Image, NewFile, NewFileTag, NewTask, NewTaskTag, Tag, Task, User};
use crate::schema::{files, files_tags, images, images_roles, roles, tags, tasks, tasks_tags, users};

pub fn find_user_by_email(conn: &mut PgConnection, email: &str) -> QueryResult<Option<User>> {
    users::table
        .filter(users::email.eq(email))
        .select(User::as_select())
        .first(conn)
        .optional()
}

pub fn ownership_tag(conn: &mut PgConnection, email: &str) -> QueryResult<Option<Tag>> {
    tags::table
        .filter(tags::name.eq(email))
        .select(Tag::as_select())
        .first(conn)
        .optional()
}

pub fn tags_named(conn: &mut PgConnection, names: &[String]) -> QueryResult<Vec<Tag>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    tags::table
        .filter(tags::name.eq_any(names))
        .select(Tag::as_select())
        .load(conn)
}

pub fn find_task(conn: &mut PgConnection, token_id: &str) -> QueryResult<Option<Task>> {
    tasks::table
        .filter(tasks::token_id.eq(token_id))
        .select(Task::as_select())
        .first(conn)
        .optional()
}

pub fn tasks_owned_by(conn: &mut PgConnection, email: &str) -> QueryResult<Vec<Task>> {
    tasks::table
        .inner_join(tasks_tags::table.inner_join(tags::table))
        .filter(tags::name.eq(email))
        .select(Task::as_select())
        .order(tasks::id.asc())
        .distinct()
        .load(conn)
}

pub fn all_tasks(conn: &mut PgConnection) -> QueryResult<Vec<Task>> {
    tasks::table
        .select(Task::as_select())
        .order(tasks::id.asc())
        .load(conn)
}

pub fn task_has_tag_named(conn: &mut PgConnection, task_id: i32, name: &str) -> QueryResult<bool> {
    diesel::select(diesel::dsl::exists(
        tasks_tags::table
            .inner_join(tags::table)
            .filter(tasks_tags::task_id.eq(task_id))
            .filter(tags::name.eq(name)),
    ))
    .get_result(conn)
}

pub fn tags_for_tasks(
    conn: &mut PgConnection,
    task_ids: &[i32],
) -> QueryResult<HashMap<i32, Vec<Tag>>> {
    let rows: Vec<(i32, Tag)> = tasks_tags::table
        .inner_join(tags::table)
        .filter(tasks_tags::task_id.eq_any(task_ids))
        .select((tasks_tags::task_id, Tag::as_select()))
        .order(tags::id.asc())
        .load(conn)?;
    let mut grouped: HashMap<i32, Vec<Tag>> = HashMap::new();
    for (task_id, tag) in rows {
        grouped.entry(task_id).or_default().push(tag);
    }
    Ok(grouped)
}

pub fn delete_task_row(conn: &mut PgConnection, token_id: &str) -> QueryResult<usize> {
    diesel::delete(tasks::table.filter(tasks::token_id.eq(token_id))).execute(conn)
}

pub fn insert_task(
    conn: &mut PgConnection,
    token_id: &str,
    name: &str,
    tag_ids: &[i32],
) -> QueryResult<Task> {
    conn.transaction(|conn| {
        delete_task_row(conn, token_id)?;
        let task: Task = diesel::insert_into(tasks::table)
            .values(&NewTask { token_id, name })
            .returning(Task::as_returning())
            .get_result(conn)?;
        replace_task_tags(conn, task.id, tag_ids)?;
        Ok(task)
    })
}

pub fn replace_task_tags(conn: &mut PgConnection, task_id: i32, tag_ids: &[i32]) -> QueryResult<()> {
    diesel::delete(tasks_tags::table.filter(tasks_tags::task_id.eq(task_id))).execute(conn)?;
    let rows: Vec<NewTaskTag> = tag_ids
        .iter()
        .map(|tag_id| NewTaskTag {
            task_id,
            tag_id: *tag_id,
        })
        .collect();
    if !rows.is_empty() {
        diesel::insert_into(tasks_tags::table)
            .values(&rows)
            .on_conflict_do_nothing()
            .execute(conn)?;
    }
    Ok(())
}

pub fn find_file(conn: &mut PgConnection, file_id: i32) -> QueryResult<Option<File>> {
    files::table
        .find(file_id)
        .select(File::as_select())
        .first(conn)
        .optional()
}

pub fn file_has_tag_named(conn: &mut PgConnection, file_id: i32, name: &str) -> QueryResult<bool> {
    diesel::select(diesel::dsl::exists(
        files_tags::table
            .inner_join(tags::table)
            .filter(files_tags::file_id.eq(file_id))
            .filter(tags::name.eq(name)),
    ))
    .get_result(conn)
}

pub fn replace_file_tags(conn: &mut PgConnection, file_id: i32, tag_ids: &[i32]) -> QueryResult<()> {
    diesel::delete(files_tags::table.filter(files_tags::file_id.eq(file_id))).execute(conn)?;
    let rows: Vec<NewFileTag> = tag_ids
        .iter()
        .map(|tag_id| NewFileTag {
            file_id,
            tag_id: *tag_id,
        })
        .collect();
    if !rows.is_empty() {
        diesel::insert_into(files_tags::table)
            .values(&rows)
            .on_conflict_do_nothing()
            .execute(conn)?;
    }
    Ok(())
}

pub fn create_file_if_absent(
    conn: &mut PgConnection,
    index: &str,
    kind: &str,
    tag_ids: &[i32],
) -> QueryResult<bool> {
    conn.transaction(|conn| {
        let inserted: Option<i32> = diesel::insert_into(files::table)
            .values(&NewFile { index, kind })
            .on_conflict(files::index)
            .do_nothing()
            .returning(files::id)
            .get_result(conn)
            .optional()?;
        match inserted {
            Some(file_id) => {
                replace_file_tags(conn, file_id, tag_ids)?;
                Ok(true)
            }
            None => Ok(false),
        }
    })
}

pub fn find_image_by_name(conn: &mut PgConnection, name: &str) -> QueryResult<Option<Image>> {
    images::table
        .filter(images::name.eq(name))
        .select(Image::as_select())
        .first(conn)
        .optional()
}

pub fn find_image_by_container_path(
    conn: &mut PgConnection,
    container_path: &str,
) -> QueryResult<Option<Image>> {
    images::table
        .filter(images::container_path.eq(container_path))
        .select(Image::as_select())
        .first(conn)
        .optional()
}

pub fn image_role_names(conn: &mut PgConnection, image_id: i32) -> QueryResult<Vec<String>> {
    images_roles::table
        .inner_join(roles::table)
        .filter(images_roles::image_id.eq(image_id))
        .select(roles::name)
        .order(roles::name.asc())
        .load(conn)
}

pub fn image_shared_with(conn: &mut PgConnection, image_id: i32, held: &[Role]) -> QueryResult<bool> {
    let shared = image_role_names(conn, image_id)?;
    Ok(held
        .iter()
        .any(|role| shared.iter().any(|name| name == role.name())))
}
