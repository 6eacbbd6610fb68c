pub mod link;
pub mod priority;
pub mod work_item;
