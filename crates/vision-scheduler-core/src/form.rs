use crate::{Result, SchedError};
use bytes::Bytes;

/// A file attachment inside a multipart form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub file_name: String,
    pub data: Bytes,
}

/// Multipart form: named string fields plus named file attachments.
///
/// Every message in the system has this shape: client submissions, the
/// commands sent to workers, worker completion callbacks and the results
/// posted back to clients. Field order is preserved for encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    fields: Vec<(String, String)>,
    files: Vec<(String, FilePart)>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style text field
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_text(name, value);
        self
    }

    /// Builder-style file attachment
    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.push_file(name, file_name, data);
        self
    }

    pub fn push_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn push_file(
        &mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) {
        self.files.push((
            name.into(),
            FilePart {
                file_name: file_name.into(),
                data: data.into(),
            },
        ));
    }

    /// All values submitted under `name`
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(field, _)| field == name)
    }

    /// The single value of `name`; zero or several values is a protocol error
    pub fn value(&self, name: &str) -> Result<&str> {
        let values = self.values(name);
        match values.as_slice() {
            [value] => Ok(value),
            _ => Err(SchedError::FormField {
                field: name.to_string(),
                actual: values.len(),
            }),
        }
    }

    /// First value of `name`, if any
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    /// First attachment submitted under `name`
    pub fn file_part(&self, name: &str) -> Result<&FilePart> {
        self.files
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, part)| part)
            .ok_or_else(|| SchedError::MissingFile(name.to_string()))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &FilePart)> {
        self.files.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn payload_len(&self) -> usize {
        let fields: usize = self.fields.iter().map(|(n, v)| n.len() + v.len()).sum();
        let files: usize = self.files.iter().map(|(_, p)| p.data.len()).sum();
        fields + files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_value_lookup() {
        let form = MultipartForm::new()
            .text("task_id", "7")
            .text("tag", "a")
            .text("tag", "b");

        assert_eq!(form.value("task_id").unwrap(), "7");
        assert_eq!(form.first_value("tag"), Some("a"));

        match form.value("tag") {
            Err(SchedError::FormField { field, actual }) => {
                assert_eq!(field, "tag");
                assert_eq!(actual, 2);
            }
            other => panic!("Expected FormField error, got {:?}", other),
        }
        assert!(matches!(
            form.value("missing"),
            Err(SchedError::FormField { actual: 0, .. })
        ));
    }

    #[test]
    fn test_file_lookup() {
        let form = MultipartForm::new().file("frame", "input.png", vec![1u8, 2, 3]);

        let part = form.file_part("frame").unwrap();
        assert_eq!(part.file_name, "input.png");
        assert_eq!(part.data.as_ref(), &[1, 2, 3]);
        assert!(matches!(form.file_part("video"), Err(SchedError::MissingFile(_))));
        assert_eq!(form.payload_len(), 3);
    }
}
