pub mod editor_handler;
pub mod mutation_task;
pub mod protocol;
pub mod rest;
pub mod state;

// Re-export the handlers to make them easily accessible
// to the binary that will build the web server router.
pub use editor_handler::editor_ws_handler;
pub use rest::{
    get_lesson_handler, list_catalog_handler, list_lesson_items_handler, update_lesson_handler,
};
