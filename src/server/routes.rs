//! Route table
//!
//! Structural segments (`_all_dbs`, `_changes`, `_design`, ...) are
//! registered as static routes so they win over the generic `/:db/:id`
//! captures. Requests for `/:db/_design/...` outside the view route
//! fall through to the attachment handler, which answers 404 for
//! reserved ids.

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::server::{changes, document_handlers, handlers};

pub fn api_routes() -> Router {
    Router::new()
        .route("/", get(handlers::welcome))
        .route("/_uuids", get(handlers::uuids))
        .route("/_all_dbs", get(handlers::all_dbs))
        .route("/_replicate", post(handlers::replicate))
        .route(
            "/:db",
            put(document_handlers::create_db)
                .get(document_handlers::db_info)
                .delete(document_handlers::delete_db)
                .post(document_handlers::post_doc),
        )
        .route("/:db/_bulk_docs", post(document_handlers::bulk_docs))
        .route(
            "/:db/_all_docs",
            get(document_handlers::all_docs).post(document_handlers::all_docs),
        )
        .route("/:db/_changes", get(changes::db_changes))
        .route("/:db/_compact", post(document_handlers::compact_db))
        .route("/:db/_revs_diff", post(document_handlers::revs_diff))
        .route("/:db/_temp_view", post(document_handlers::temp_view))
        .route(
            "/:db/_design/:id/_view/:view",
            get(document_handlers::design_view),
        )
        .route(
            "/:db/:id",
            put(document_handlers::put_doc)
                .get(document_handlers::get_doc)
                .delete(document_handlers::delete_doc),
        )
        .route(
            "/:db/:id/*attachment",
            put(document_handlers::put_attachment)
                .get(document_handlers::get_attachment)
                .delete(document_handlers::delete_attachment),
        )
}
