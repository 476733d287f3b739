use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who the generated documentation and diagram are written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Audience {
    #[default]
    Technical,
    NonTechnical,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Audience::Technical => "technical",
            Audience::NonTechnical => "non-technical",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "technical" => Ok(Audience::Technical),
            "non-technical" | "nontechnical" | "non_technical" => Ok(Audience::NonTechnical),
            other => Err(format!("unknown audience '{other}' (expected technical or non-technical)")),
        }
    }
}

pub fn documentation_prompt(audience: Audience) -> String {
    format!(
        "Generate clear, concise, and comprehensive documentation for the code in context ensuring you explain its\n\
         functionality, usage, parameters, and any potential edge cases or limitations. Also, make sure to include any dependencies,\n\
         data sources or APIs that are used.\n\
         The documentation should be written for a {audience} audience."
    )
}

pub fn diagram_prompt(audience: Audience) -> String {
    format!(
        "Create flowchart diagram for the code in context using Graphviz in Python.\n\
         Ensure that the diagram is clear and shows the most important parts of the code.\n\
         Use common naming conventions, and DO NOT render the dot variable.\n\
         DO NOT include pip install steps.\n\
         The diagram should be written for a {audience} audience."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_name_the_audience() {
        let doc = documentation_prompt(Audience::NonTechnical);
        assert!(doc.ends_with("written for a non-technical audience."));
        assert!(doc.contains("potential edge cases or limitations"));

        let diagram = diagram_prompt(Audience::Technical);
        assert!(diagram.contains("using Graphviz in Python"));
        assert!(diagram.contains("DO NOT render the dot variable"));
        assert!(diagram.contains("DO NOT include pip install steps"));
        assert!(diagram.ends_with("written for a technical audience."));
    }

    #[test]
    fn audience_parses() {
        assert_eq!("Technical".parse::<Audience>(), Ok(Audience::Technical));
        assert_eq!("non-technical".parse::<Audience>(), Ok(Audience::NonTechnical));
        assert!("managers".parse::<Audience>().is_err());
    }
}
