//! Chain with a tool-backed step: extract a profile from free text, build a
//! resume outline (skills filtered through the `match_skills` tool), then
//! write a cover letter.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use weft_core::tool::{ToolError, ToolRegistry};
use weft_core::workflow::{ActivityError, Registry, RegistryError, WorkflowContext, WorkflowError};
use weft_types::workflow::ActivityOptions;

use super::parse_input;

pub const WORKFLOW: &str = "job_application";

const ROLE_REQUIREMENTS: [(&str, &[&str]); 3] = [
    ("software engineer", &["Python", "JavaScript", "Git", "Cloud", "Teamwork"]),
    (
        "full stack developer",
        &["JavaScript", "HTML/CSS", "React", "Node.js", "Python", "Git"],
    ),
    ("data analyst", &["SQL", "Excel", "Visualization", "Statistics", "Python"]),
];

const KNOWN_SKILLS: [&str; 14] = [
    "Python",
    "JavaScript",
    "Git",
    "Cloud",
    "Teamwork",
    "Leadership",
    "HTML/CSS",
    "React",
    "Node.js",
    "SQL",
    "Excel",
    "Visualization",
    "Statistics",
    "Docker",
];

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UserProfile {
    pub role: String,
    pub skills: Vec<String>,
    pub goal: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ResumeOutline {
    pub summary: String,
    pub skills: Vec<String>,
    pub experience: Vec<String>,
}

/// Arguments of the `match_skills` tool.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct SkillMatch {
    /// Target job role.
    pub role: String,
    /// Skills the applicant lists.
    pub skills: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CoverLetterInput {
    pub resume_info: ResumeOutline,
}

/// Tools available to the job application activities.
pub fn tools() -> Result<ToolRegistry, ToolError> {
    let mut tools = ToolRegistry::new();
    tools.register(
        "match_skills",
        "Match user skills to role requirements.",
        |args: SkillMatch| async move { Ok::<_, ToolError>(match_skills(&args.role, &args.skills)) },
    )?;
    Ok(tools)
}

pub fn register(registry: &mut Registry, tools: Arc<ToolRegistry>) -> Result<(), RegistryError> {
    registry.register_typed_activity(
        "extract_user_profile",
        ActivityOptions::default(),
        extract_user_profile,
    )?;
    registry.register_typed_activity(
        "generate_resume_outline",
        ActivityOptions::default(),
        move |profile: UserProfile| {
            let tools = Arc::clone(&tools);
            async move { generate_resume_outline(&tools, profile).await }
        },
    )?;
    registry.register_typed_activity(
        "write_cover_letter",
        ActivityOptions::default(),
        write_cover_letter,
    )?;
    registry.register_workflow(WORKFLOW, job_application)
}

/// Input: the applicant's free-text description.
async fn job_application(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
    let user_input: String = parse_input(WORKFLOW, input)?;

    let profile = ctx
        .call_activity("extract_user_profile", json!(user_input))
        .await?;
    let resume = ctx
        .call_activity("generate_resume_outline", profile)
        .await?;
    let letter = ctx
        .call_activity("write_cover_letter", json!({ "resume_info": resume }))
        .await?;
    Ok(letter)
}

/// Skills that overlap a requirement of `role` (case-insensitive substring
/// match either way). Unknown roles match nothing.
pub fn match_skills(role: &str, skills: &[String]) -> Vec<String> {
    let role = role.to_lowercase();
    let Some((_, requirements)) = ROLE_REQUIREMENTS.iter().find(|(name, _)| *name == role) else {
        return Vec::new();
    };

    skills
        .iter()
        .filter(|skill| {
            let skill = skill.to_lowercase();
            requirements.iter().any(|req| {
                let req = req.to_lowercase();
                skill.contains(&req) || req.contains(&skill)
            })
        })
        .cloned()
        .collect()
}

async fn extract_user_profile(user_input: String) -> Result<UserProfile, ActivityError> {
    let text = user_input.to_lowercase();
    if text.trim().is_empty() {
        return Err(ActivityError::InvalidInput("empty application text".to_string()));
    }

    let role = ROLE_REQUIREMENTS
        .iter()
        .map(|(name, _)| *name)
        .find(|name| text.contains(name))
        .unwrap_or("generalist")
        .to_string();
    let skills: Vec<String> = KNOWN_SKILLS
        .iter()
        .filter(|skill| text.contains(&skill.to_lowercase()))
        .map(|skill| skill.to_string())
        .collect();

    Ok(UserProfile {
        goal: format!("Land a {role} position"),
        role,
        skills,
    })
}

async fn generate_resume_outline(
    tools: &ToolRegistry,
    profile: UserProfile,
) -> Result<ResumeOutline, ActivityError> {
    let matched = tools
        .invoke(
            "match_skills",
            json!({ "role": profile.role, "skills": profile.skills }),
        )
        .await
        .map_err(|e| ActivityError::failed(e.to_string()))?;
    let skills: Vec<String> = serde_json::from_value(matched)?;

    let experience = if skills.is_empty() {
        vec![format!("Transferable experience toward {}", profile.goal.to_lowercase())]
    } else {
        skills
            .iter()
            .map(|skill| format!("Delivered production work using {skill}"))
            .collect()
    };

    Ok(ResumeOutline {
        summary: format!(
            "Aspiring {} with {} relevant skill(s). Goal: {}.",
            profile.role,
            skills.len(),
            profile.goal
        ),
        skills,
        experience,
    })
}

async fn write_cover_letter(input: CoverLetterInput) -> Result<String, ActivityError> {
    let resume = input.resume_info;
    let strengths = if resume.skills.is_empty() {
        "a willingness to learn".to_string()
    } else {
        resume.skills.join(", ")
    };
    Ok(format!(
        "Dear Hiring Manager,\n\n{}\n\nMy strengths include {strengths}. I would be excited to bring them to your team.\n\nSincerely,\nThe Applicant",
        resume.summary
    ))
}
