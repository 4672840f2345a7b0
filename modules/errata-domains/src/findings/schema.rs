use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::InvestigationError;
use crate::investigations::ClaimDraft;

/// Structured output of the investigation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClaimList {
    /// Factual errors found in the post. Empty when there are none.
    pub claims: Vec<ClaimDraft>,
}

impl ClaimList {
    /// Checks the schema cannot express.
    pub fn check_semantics(&self) -> Result<(), InvestigationError> {
        for (index, claim) in self.claims.iter().enumerate() {
            if claim.text.trim().is_empty() {
                return Err(InvestigationError::StructuredOutputSemantic(format!(
                    "claim {index} has empty text"
                )));
            }
            if claim.sources.is_empty() {
                return Err(InvestigationError::StructuredOutputSemantic(format!(
                    "claim {index} cites no sources"
                )));
            }
            for source in &claim.sources {
                let parsed = url::Url::parse(&source.url).map_err(|e| {
                    InvestigationError::StructuredOutputSemantic(format!(
                        "claim {index} source {:?}: {e}",
                        source.url
                    ))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(InvestigationError::StructuredOutputSemantic(format!(
                        "claim {index} source {:?} is not http(s)",
                        source.url
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Structured output of one claim validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClaimValidationVerdict {
    /// True only if the claimed error is real and the sources support it.
    pub approved: bool,
    pub reasoning: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::investigations::ClaimSource;

    fn claim(text: &str, url: &str) -> ClaimDraft {
        ClaimDraft {
            text: text.into(),
            context: "ctx".into(),
            summary: "sum".into(),
            reasoning: "why".into(),
            sources: vec![ClaimSource {
                url: url.into(),
                title: None,
                snippet: None,
            }],
        }
    }

    #[test]
    fn valid_claims_pass() {
        let list = ClaimList {
            claims: vec![claim("The moon is cheese", "https://nasa.gov/moon")],
        };
        assert!(list.check_semantics().is_ok());
        assert!(ClaimList { claims: vec![] }.check_semantics().is_ok());
    }

    #[test]
    fn blank_text_and_bad_urls_are_rejected() {
        for list in [
            ClaimList { claims: vec![claim("  ", "https://a.example")] },
            ClaimList { claims: vec![claim("x", "not a url")] },
            ClaimList { claims: vec![claim("x", "ftp://a.example/file")] },
        ] {
            assert!(matches!(
                list.check_semantics(),
                Err(InvestigationError::StructuredOutputSemantic(_))
            ));
        }
    }

    #[test]
    fn claim_list_schema_is_strict() {
        use ai_client::StructuredOutput;
        let schema = ClaimList::strict_schema();
        let claim = &schema["properties"]["claims"]["items"];
        assert_eq!(claim["additionalProperties"], serde_json::Value::Bool(false));
        let source = &claim["properties"]["sources"]["items"];
        assert_eq!(source["required"].as_array().unwrap().len(), 3);
    }
}
