use thiserror::Error;

/// Scanned-image PDFs extract to almost nothing; below this there is not
/// enough text to critique.
const MIN_TEXT_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction error: {0}")]
    Parse(#[from] pdf_extract::OutputError),

    #[error(
        "could not extract enough text from PDF ({0} chars) - make sure it is not a scanned image"
    )]
    TooShort(usize),
}

pub fn extract_resume_text(data: &[u8]) -> Result<String, ExtractError> {
    let text = pdf_extract::extract_text_from_mem(data)?;
    ensure_min_length(text.trim().to_string())
}

fn ensure_min_length(text: String) -> Result<String, ExtractError> {
    let chars = text.chars().count();
    if chars < MIN_TEXT_CHARS {
        return Err(ExtractError::TooShort(chars));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_near_empty_text() {
        let err = ensure_min_length("John Doe".to_string()).unwrap_err();
        assert!(matches!(err, ExtractError::TooShort(8)));
    }

    #[test]
    fn accepts_text_at_the_floor() {
        let text = "x".repeat(50);
        assert_eq!(ensure_min_length(text.clone()).unwrap(), text);
    }

    #[test]
    fn garbage_bytes_are_a_parse_error() {
        let err = extract_resume_text(b"definitely not a pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Parse(_)));
    }
}
