//! External collaborators: the session store and the generation service.
//!
//! The preview core only consumes these. `generated_source` from a
//! [`GenerationReply`] is treated as an opaque [`SourceUnit`] and goes straight
//! to the packager. The in-memory store and the canned generator stand in for
//! real backends.

use crate::error::CollabError;
use crate::source::SourceUnit;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub session_id: Uuid,
    pub message_history: Vec<Message>,
    pub new_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReply {
    pub assistant_reply: String,
    pub generated_source: Option<SourceUnit>,
}

/// Session metadata and message history keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Sessions, newest first.
    async fn list(&self) -> Result<Vec<Session>, CollabError>;

    async fn create(&self, name: &str) -> Result<Session, CollabError>;

    async fn delete(&self, id: Uuid) -> Result<(), CollabError>;

    async fn get_messages(&self, id: Uuid) -> Result<Vec<Message>, CollabError>;

    async fn append_message(&self, id: Uuid, message: Message) -> Result<(), CollabError>;
}

/// Turns a conversation into an assistant reply and, optionally, source.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationReply, CollabError>;
}

/// Record a user message, ask the generator, and record its reply.
pub async fn send_message(
    store: &dyn SessionStore,
    generator: &dyn GenerationService,
    session_id: Uuid,
    content: &str,
) -> Result<GenerationReply, CollabError> {
    let message_history = store.get_messages(session_id).await?;
    store.append_message(session_id, Message::user(content)).await?;

    let reply = generator
        .generate(GenerationRequest {
            session_id,
            message_history,
            new_message: content.to_string(),
        })
        .await?;

    store
        .append_message(session_id, Message::assistant(&reply.assistant_reply))
        .await?;
    tracing::debug!(
        session = %session_id,
        has_source = reply.generated_source.is_some(),
        "generation complete"
    );
    Ok(reply)
}

struct SessionRecord {
    session: Session,
    messages: Vec<Message>,
}

/// Non-persistent [`SessionStore`].
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<Vec<SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the builder's two sample sessions.
    pub fn with_samples() -> Self {
        let now = Utc::now();
        let login = SessionRecord {
            session: Session {
                id: Uuid::new_v4(),
                name: "Login Form".to_string(),
                created_at: now,
                message_count: 2,
            },
            messages: vec![
                Message::user("Create a modern login form with email and password fields"),
                Message::assistant(
                    "I'll create a modern login form component for you with email and password fields, including proper validation and styling.",
                ),
            ],
        };
        let card = SessionRecord {
            session: Session {
                id: Uuid::new_v4(),
                name: "Product Card".to_string(),
                created_at: now - Duration::days(1),
                message_count: 0,
            },
            messages: Vec::new(),
        };
        Self {
            sessions: RwLock::new(vec![login, card]),
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn list(&self) -> Result<Vec<Session>, CollabError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.iter().map(|r| r.session.clone()).collect())
    }

    async fn create(&self, name: &str) -> Result<Session, CollabError> {
        let session = Session {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
            message_count: 0,
        };
        self.sessions.write().await.insert(
            0,
            SessionRecord {
                session: session.clone(),
                messages: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn delete(&self, id: Uuid) -> Result<(), CollabError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|r| r.session.id != id);
        if sessions.len() == before {
            return Err(CollabError::SessionNotFound(id));
        }
        Ok(())
    }

    async fn get_messages(&self, id: Uuid) -> Result<Vec<Message>, CollabError> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .find(|r| r.session.id == id)
            .map(|r| r.messages.clone())
            .ok_or(CollabError::SessionNotFound(id))
    }

    async fn append_message(&self, id: Uuid, message: Message) -> Result<(), CollabError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .iter_mut()
            .find(|r| r.session.id == id)
            .ok_or(CollabError::SessionNotFound(id))?;
        record.messages.push(message);
        record.session.message_count += 1;
        Ok(())
    }
}

/// Canned [`GenerationService`]: picks a sample component by keyword.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockGenerator;

const MOCK_REPLY: &str = "I'll help you create that component. Let me generate the code for you.";

#[async_trait]
impl GenerationService for MockGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationReply, CollabError> {
        let prompt = request.new_message.to_lowercase();
        let source = if prompt.contains("button") {
            SourceUnit::named(BUTTON_SOURCE, "App")
        } else if prompt.contains("login") {
            SourceUnit::default_export(LOGIN_FORM_SOURCE)
        } else {
            let quoted = serde_json::to_string(&request.new_message)
                .map_err(|e| CollabError::Generation(e.to_string()))?;
            SourceUnit::default_export(GENERIC_SOURCE.replace("__PROMPT__", &quoted))
        };

        Ok(GenerationReply {
            assistant_reply: MOCK_REPLY.to_string(),
            generated_source: Some(source),
        })
    }
}

const BUTTON_SOURCE: &str = r#"import React from 'react';

const CustomButton = ({ children, onClick, variant = 'primary' }) => {
  const baseStyles = 'px-4 py-2 rounded-lg font-medium transition duration-200';
  const variants = {
    primary: 'bg-blue-600 text-white hover:bg-blue-700',
    secondary: 'bg-gray-200 text-gray-800 hover:bg-gray-300',
    danger: 'bg-red-600 text-white hover:bg-red-700'
  };

  return (
    <button
      className={`${baseStyles} ${variants[variant]}`}
      onClick={onClick}
    >
      {children}
    </button>
  );
};

window.App = () => (
  <div className="p-8 space-y-4">
    <CustomButton variant="primary">Primary Button</CustomButton>
    <CustomButton variant="secondary">Secondary Button</CustomButton>
    <CustomButton variant="danger">Danger Button</CustomButton>
  </div>
);

export default CustomButton;
"#;

const LOGIN_FORM_SOURCE: &str = r##"import React, { useState } from 'react';

const LoginForm = () => {
  const [email, setEmail] = useState('');
  const [password, setPassword] = useState('');
  const [errors, setErrors] = useState({});

  const handleSubmit = (e) => {
    e.preventDefault();
    const newErrors = {};

    if (!email) newErrors.email = 'Email is required';
    if (!password) newErrors.password = 'Password is required';

    if (Object.keys(newErrors).length === 0) {
      console.log('Login attempt:', { email });
    } else {
      setErrors(newErrors);
    }
  };

  return (
    <div className="max-w-md mx-auto bg-white p-8 rounded-lg shadow-lg">
      <h2 className="text-2xl font-bold text-center mb-6 text-gray-800">
        Welcome Back
      </h2>

      <form onSubmit={handleSubmit} className="space-y-4">
        <div>
          <label className="block text-sm font-medium text-gray-700 mb-1">
            Email
          </label>
          <input
            type="email"
            value={email}
            onChange={(e) => setEmail(e.target.value)}
            className="w-full px-3 py-2 border border-gray-300 rounded-lg"
            placeholder="Enter your email"
          />
          {errors.email && (
            <p className="text-red-500 text-sm mt-1">{errors.email}</p>
          )}
        </div>

        <div>
          <label className="block text-sm font-medium text-gray-700 mb-1">
            Password
          </label>
          <input
            type="password"
            value={password}
            onChange={(e) => setPassword(e.target.value)}
            className="w-full px-3 py-2 border border-gray-300 rounded-lg"
            placeholder="Enter your password"
          />
          {errors.password && (
            <p className="text-red-500 text-sm mt-1">{errors.password}</p>
          )}
        </div>

        <button
          type="submit"
          className="w-full bg-blue-600 text-white py-2 px-4 rounded-lg font-medium"
        >
          Sign In
        </button>
      </form>

      <p className="text-center text-sm text-gray-600 mt-4">
        Don't have an account?{' '}
        <a href="#" className="text-blue-600 hover:underline">
          Sign up
        </a>
      </p>
    </div>
  );
};

window.App = LoginForm;
export default LoginForm;
"##;

const GENERIC_SOURCE: &str = r#"import React from 'react';

const GeneratedComponent = () => {
  return (
    <div className="p-8 bg-gray-50 rounded-lg">
      <h2 className="text-2xl font-bold text-gray-800 mb-4">
        Generated Component
      </h2>
      <p className="text-gray-600">
        This component was generated based on your request: "{__PROMPT__}"
      </p>
    </div>
  );
};

export default GeneratedComponent;
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packager;
    use crate::source::EntryPoint;

    #[tokio::test]
    async fn test_create_list_delete() {
        let store = InMemorySessionStore::new();
        let first = store.create("First").await.unwrap();
        let second = store.create("Second").await.unwrap();

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Second", "First"]);

        store.delete(first.id).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(matches!(
            store.delete(first.id).await,
            Err(CollabError::SessionNotFound(_))
        ));
        assert!(store.get_messages(second.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_records_both_sides() {
        let store = InMemorySessionStore::new();
        let session = store.create("Buttons").await.unwrap();

        let reply = send_message(&store, &MockGenerator, session.id, "Make me a button")
            .await
            .unwrap();
        assert_eq!(reply.assistant_reply, MOCK_REPLY);
        assert_eq!(
            reply.generated_source.unwrap().entry,
            EntryPoint::Named("App".into())
        );

        let messages = store.get_messages(session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(store.list().await.unwrap()[0].message_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = InMemorySessionStore::new();
        let result = send_message(&store, &MockGenerator, Uuid::new_v4(), "hi").await;
        assert!(matches!(result, Err(CollabError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_samples_seeded() {
        let store = InMemorySessionStore::with_samples();
        let sessions = store.list().await.unwrap();
        assert_eq!(sessions[0].name, "Login Form");
        assert_eq!(store.get_messages(sessions[0].id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_sources_package() {
        for prompt in ["a button", "login form please", "a pricing table with \"quotes\" {braces}"] {
            let reply = MockGenerator
                .generate(GenerationRequest {
                    session_id: Uuid::new_v4(),
                    message_history: Vec::new(),
                    new_message: prompt.to_string(),
                })
                .await
                .unwrap();
            let unit = reply.generated_source.unwrap();
            let document = packager::package(&unit).unwrap();
            assert!(document.is_resolved(), "{prompt}");
        }
    }
}
