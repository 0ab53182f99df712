pub mod change_event;
pub mod json_cell;
