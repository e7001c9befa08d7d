use crate::error::{invalid_argument, FirestoreResult};

pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default_database(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    /// Parses a `projects/{project}/databases/{database}` resource name.
    pub fn from_name(name: &str) -> FirestoreResult<Self> {
        let segments: Vec<&str> = name.split('/').collect();
        match segments.as_slice() {
            ["projects", project, "databases", database]
                if !project.is_empty() && !database.is_empty() =>
            {
                Ok(Self::new(*project, *database))
            }
            _ => Err(invalid_argument(format!(
                "Invalid database name ({name}). Expected projects/{{project}}/databases/{{database}}."
            ))),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }
}
