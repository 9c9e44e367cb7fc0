//! Multipart body for account registration.

use axum::body::Bytes;

#[derive(Debug, Clone)]
struct FilePart {
    name: String,
    filename: String,
    content_type: String,
    data: Bytes,
}

/// Registration form data, sent as `multipart/form-data`.
#[derive(Debug, Clone)]
pub struct RegistrationForm {
    boundary: String,
    fields: Vec<(String, String)>,
    files: Vec<FilePart>,
}

impl RegistrationForm {
    /// Form with the fields every registration needs.
    pub fn new(email: &str, username: &str, password: &str) -> Self {
        Self {
            boundary: format!("bazaar-{}", uuid::Uuid::new_v4().simple()),
            fields: Vec::new(),
            files: Vec::new(),
        }
        .text("email", email)
        .text("username", username)
        .text("password", password)
    }

    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Attach a file, e.g. an avatar.
    #[must_use]
    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.files.push(FilePart {
            name: name.into(),
            filename: filename.into(),
            content_type: content_type.into(),
            data: data.into(),
        });
        self
    }

    /// Email field, used for logging.
    pub fn email(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == "email")
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn to_body(&self) -> Bytes {
        let mut body = Vec::new();

        for (name, value) in &self.fields {
            body.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    escape(name)
                )
                .as_bytes(),
            );
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }

        for file in &self.files {
            body.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                    escape(&file.name),
                    escape(&file.filename),
                    file.content_type
                )
                .as_bytes(),
            );
            body.extend_from_slice(&file.data);
            body.extend_from_slice(b"\r\n");
        }

        body.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        Bytes::from(body)
    }
}

/// Quotes and line breaks would end the header parameter early.
fn escape(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
