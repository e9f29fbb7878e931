use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Administrator,
}

/// The already authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: i64,
    pub name: String,
    pub role: Role,
    /// Projects the user is a manager of.
    #[serde(default)]
    pub managed_projects: Vec<String>,
}

impl CurrentUser {
    pub fn new(id: i64, name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            name: name.into(),
            role,
            managed_projects: vec![],
        }
    }

    pub fn with_managed_projects(mut self, projects: Vec<String>) -> Self {
        self.managed_projects = projects;
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Administrator
    }

    pub fn manages(&self, project_id: &str) -> bool {
        self.managed_projects.iter().any(|p| p == project_id)
    }
}
