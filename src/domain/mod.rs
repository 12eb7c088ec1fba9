//! Domain entities and value objects.
//!
//! Stories, subtasks and comments are produced by parsing the markdown
//! document; identifiers are normalised value objects compared by value.

mod entities;
mod enums;
mod value_objects;

pub use entities::{Comment, Epic, Subtask, UserStory};
pub use enums::{IssueType, Priority, Status};
pub use value_objects::{AcceptanceCriteria, Description, IssueKey, StoryDescription, StoryId};
