use serde_json::{json, Value};
use uuid::Uuid;

use crate::types::CompanyCandidate;

/// Pure resolution engine mapping a lookup display name and the matching
/// company rows onto a resolution decision. The engine performs no I/O;
/// gathering candidates and applying the resulting write are the caller's
/// concern.
pub struct ResolutionEngine;

impl ResolutionEngine {
    /// Evaluates the resolution decision for the provided display name and
    /// the company rows matching it.
    ///
    /// Candidates are expected in most-recent-first order; ties and unordered
    /// input are settled deterministically by `created_at`.
    pub fn resolve(name: Option<&str>, candidates: &[CompanyCandidate]) -> ResolutionOutcome {
        let name = match name.filter(|value| !value.is_empty()) {
            Some(value) => value,
            None => return ResolutionOutcome::use_default(ResolutionBranch::MissingName),
        };

        let Some(company) = Self::latest(candidates) else {
            return ResolutionOutcome::use_default(ResolutionBranch::NoMatch);
        };

        debug_assert_eq!(company.name, name);

        if company.parent_org_id.is_none() {
            return ResolutionOutcome::unresolved();
        }

        ResolutionOutcome::resolved(ResolvedReferences {
            company_id: company.id,
            group_id: company.group_id,
        })
    }

    /// Returns the references carried by the default company, taken from the
    /// rows matching the sentinel name. The parent-org gate does not apply to
    /// the default; its group is relayed when present.
    pub fn default_references(candidates: &[CompanyCandidate]) -> Option<ResolvedReferences> {
        Self::latest(candidates).map(|company| ResolvedReferences {
            company_id: company.id,
            group_id: company.group_id,
        })
    }

    /// Picks the most recently created candidate, keeping the earliest slice
    /// position when several share a timestamp.
    fn latest(candidates: &[CompanyCandidate]) -> Option<&CompanyCandidate> {
        candidates.iter().reduce(|best, candidate| {
            if candidate.created_at > best.created_at {
                candidate
            } else {
                best
            }
        })
    }
}

/// References selected by a successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedReferences {
    pub company_id: Uuid,
    pub group_id: Option<Uuid>,
}

/// Decision produced by the resolution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A company matched and carries a parent-org reference; write its id
    /// (and group id, when present) back onto the record.
    Resolved(ResolvedReferences),
    /// No usable name or no match; fall back to the default company.
    UseDefault,
    /// A company matched but lacks a parent-org reference; the record is
    /// deliberately left untouched.
    Unresolved,
}

/// Resolution decision together with the branch that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub resolution: Resolution,
    pub branch: ResolutionBranch,
}

impl ResolutionOutcome {
    fn resolved(references: ResolvedReferences) -> Self {
        Self {
            resolution: Resolution::Resolved(references),
            branch: ResolutionBranch::Matched,
        }
    }

    fn use_default(branch: ResolutionBranch) -> Self {
        Self {
            resolution: Resolution::UseDefault,
            branch,
        }
    }

    fn unresolved() -> Self {
        Self {
            resolution: Resolution::Unresolved,
            branch: ResolutionBranch::MissingParentOrg,
        }
    }

    /// Returns a redacted payload suitable for tap output.
    pub fn redacted(&self) -> Value {
        let references = match &self.resolution {
            Resolution::Resolved(references) => json!({
                "company_id": references.company_id,
                "group_id": references.group_id,
            }),
            Resolution::UseDefault | Resolution::Unresolved => Value::Null,
        };
        json!({
            "branch": self.branch.as_str(),
            "references": references,
        })
    }
}

/// Names the decision branch taken, for diagnostics and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionBranch {
    Matched,
    MissingParentOrg,
    NoMatch,
    MissingName,
}

impl ResolutionBranch {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::MissingParentOrg => "missing_parent_org",
            Self::NoMatch => "no_match",
            Self::MissingName => "missing_name",
        }
    }
}
