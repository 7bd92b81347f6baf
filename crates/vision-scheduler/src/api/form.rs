use axum::extract::Multipart;
use vision_scheduler_core::{MultipartForm, Result, SchedError};

fn malformed(e: axum::extract::multipart::MultipartError) -> SchedError {
    SchedError::InvalidRequest(format!("malformed multipart body: {}", e.body_text()))
}

/// Drain an axum multipart body; parts carrying a file name become attachments
pub async fn read_form(mut multipart: Multipart) -> Result<MultipartForm> {
    let mut form = MultipartForm::new();

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let data = field.bytes().await.map_err(malformed)?;
                form.push_file(name, file_name, data);
            }
            None => {
                let value = field.text().await.map_err(malformed)?;
                form.push_text(name, value);
            }
        }
    }

    Ok(form)
}
