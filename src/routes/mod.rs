use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, patch, post},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

pub mod auth;
pub mod files;
pub mod health;
pub mod images;
pub mod roles;
pub mod tags;
pub mod tasks;
pub mod users;

fn cors_layer(allowed_origin: Option<&str>) -> CorsLayer {
    let allow_origin = match allowed_origin {
        Some(origins) => AllowOrigin::list(origins.split(',').filter_map(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(origin) => Some(origin),
                Err(err) => {
                    tracing::warn!(origin = %trimmed, error = %err, "ignoring invalid CORS origin");
                    None
                }
            }
        })),
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(state.config.cors_allowed_origin.as_deref());

    let auth_router = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/viewable_pages", get(auth::viewable_pages))
        .route("/user_authorized", post(auth::user_authorized));

    let users_router = Router::new()
        .route(
            "/admin",
            get(users::list_users).delete(users::delete_user),
        )
        .route("/current", get(users::current_user))
        .route("/email", get(users::current_email))
        .route("/roles", get(users::role_status));

    let tags_router = Router::new()
        .route("/", get(tags::list_tags))
        .route(
            "/admin",
            get(tags::list_custom_tags)
                .post(tags::create_custom_tag)
                .delete(tags::delete_custom_tag),
        );

    let images_router = Router::new()
        .route(
            "/",
            get(images::list_images)
                .post(images::create_image)
                .put(images::rename_image)
                .patch(images::update_image_roles)
                .delete(images::delete_image),
        )
        .route("/stored_parameters", post(images::stored_parameters));

    let files_router = Router::new()
        .route("/", get(files::list_files))
        .route("/upload", post(files::upload_files))
        .route("/download/:id", get(files::download_file))
        .route(
            "/:id",
            patch(files::update_file_tags).delete(files::delete_file),
        );

    let tasks_router = Router::new()
        .route("/", get(tasks::list_tasks).post(tasks::create_task))
        .route(
            "/:token_id",
            get(tasks::get_task)
                .patch(tasks::update_task_tags)
                .delete(tasks::delete_task),
        );

    Router::new()
        .route("/api/health", get(health::health_check))
        .nest("/api/auth", auth_router)
        .nest("/api/users", users_router)
        .route("/api/roles", get(roles::list_roles))
        .route("/api/roles/admin", patch(roles::update_user_roles))
        .nest("/api/tags", tags_router)
        .nest("/api/images", images_router)
        .nest("/api/files", files_router)
        .nest("/api/tasks", tasks_router)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::middleware::authorize,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024 * 512))
}
