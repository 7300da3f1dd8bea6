//! Markdown posted to the incident channel.

use std::fmt::Write;

use crate::model::{
    CandidateOwner, Diagnosis, EvidenceId, EvidenceItem, Incident, IntegrationKind, PastIncident,
};

const SEEN_BEFORE_LIMIT: usize = 3;

/// Where a citation points: the vendor link when the integration gave one,
/// otherwise the evidence endpoint of the HTTP surface.
pub fn evidence_link(item: &EvidenceItem, public_url: &str) -> String {
    match &item.link {
        Some(link) => link.clone(),
        None => format!(
            "{}/incidents/{}/evidence/{}",
            public_url.trim_end_matches('/'),
            item.incident_id,
            item.id
        ),
    }
}

pub fn citation(item: &EvidenceItem, public_url: &str) -> String {
    format!("[#{}]({})", item.id, evidence_link(item, public_url))
}

pub struct SummaryInput<'a> {
    pub incident: &'a Incident,
    pub diagnosis: &'a Diagnosis,
    pub candidates: &'a [CandidateOwner],
    /// Display name and on-call of whoever the incident is handed to.
    pub owner: &'a str,
    pub evidence: &'a [EvidenceItem],
    /// Earlier incidents on the service; tentative diagnoses are left out.
    pub history: &'a [PastIncident],
    pub public_url: &'a str,
}

pub fn format_summary(input: &SummaryInput<'_>) -> String {
    let SummaryInput {
        incident,
        diagnosis,
        candidates,
        owner,
        evidence,
        history,
        public_url,
    } = input;
    let cite = |ids: &[EvidenceId]| -> String {
        ids.iter()
            .filter_map(|id| evidence.iter().find(|item| item.id == *id))
            .map(|item| citation(item, public_url))
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut out = String::new();
    let _ = writeln!(out, "## Incident {}: {}", incident.incident_id, incident.alert.title);
    let _ = writeln!(
        out,
        "**Severity:** {} | **Service:** {} | **Owner:** {}",
        incident.severity.map(|s| s.as_str()).unwrap_or("unknown"),
        incident.service,
        owner
    );
    if let Some(url) = &incident.alert.html_url {
        let _ = writeln!(out, "**Alert:** {url}");
    }
    out.push('\n');

    let _ = writeln!(
        out,
        "**Possible cause:** {} (confidence {:.2})",
        diagnosis.hypothesis, diagnosis.confidence
    );
    if diagnosis.low_confidence {
        let _ = writeln!(
            out,
            "> Low confidence: {}",
            diagnosis
                .caveat
                .as_deref()
                .unwrap_or("evidence is incomplete")
        );
    }

    if !diagnosis.claims.is_empty() {
        out.push_str("\n**Findings**\n");
        for claim in &diagnosis.claims {
            let _ = writeln!(out, "- {} {}", claim.statement, cite(&claim.citations));
        }
    }

    if !candidates.is_empty() {
        out.push_str("\n**Candidate owners**\n");
        for candidate in candidates.iter() {
            let _ = writeln!(
                out,
                "- {} ({:.2}): {} {}",
                candidate.display_name,
                candidate.confidence,
                candidate.rationale,
                cite(&candidate.evidence)
            );
        }
    }

    let seen: Vec<&PastIncident> = history
        .iter()
        .filter(|past| !past.low_confidence)
        .take(SEEN_BEFORE_LIMIT)
        .collect();
    if !seen.is_empty() {
        out.push_str("\n**Seen before**\n");
        for past in seen {
            let _ = writeln!(
                out,
                "- {} ({}, {}): {}{}",
                past.incident_id,
                past.diagnosed_at.format("%Y-%m-%d"),
                past.status.as_str(),
                past.hypothesis,
                past.owner
                    .as_deref()
                    .map(|team| format!(", owned by {team}"))
                    .unwrap_or_default()
            );
        }
    }

    out.push_str("\n**Next steps**\n");
    for (n, step) in diagnosis.next_steps.iter().enumerate() {
        let _ = writeln!(out, "{}. {step}", n + 1);
    }

    let cited: Vec<&EvidenceItem> = diagnosis
        .citations
        .iter()
        .filter_map(|id| evidence.iter().find(|item| item.id == *id))
        .collect();
    let panels: Vec<&EvidenceItem> = evidence
        .iter()
        .filter(|item| item.source == IntegrationKind::Grafana && item.media.is_some())
        .collect();
    if !cited.is_empty() || !panels.is_empty() {
        out.push_str("\n**Evidence**\n");
        for item in &cited {
            let _ = writeln!(
                out,
                "- [#{} {}]({}) {}",
                item.id,
                item.source.as_str(),
                evidence_link(item, public_url),
                item.summary
            );
        }
        for item in &panels {
            if let Some(media) = &item.media {
                let _ = writeln!(out, "![{}]({media})", item.summary);
            }
        }
    }
    out
}
