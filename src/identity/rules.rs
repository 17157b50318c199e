use crate::error::{GatewayError, GatewayResult};
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

// ---------------------------------------------------------------------------
// Skill-matching rules
// ---------------------------------------------------------------------------

/// One ordered identity rule: agents whose declared skills satisfy the
/// rule are assigned `role`. Rules are evaluated in descending priority,
/// insertion order breaking ties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SkillMatchRule {
    pub role: String,
    /// AND set: every id must be declared by the agent.
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// OR set: at least `min_skill_match` must be declared.
    #[serde(default)]
    pub any_skills: Vec<String>,
    #[serde(default = "default_min_skill_match")]
    pub min_skill_match: usize,
    /// Declaring any of these disqualifies the rule outright.
    #[serde(default)]
    pub forbidden_skills: Vec<String>,
    #[serde(default)]
    pub context: Option<RuleContext>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_min_skill_match() -> usize {
    1
}

/// Time-window constraint on a rule. Days and times are interpreted in
/// `timezone` (IANA name); an overnight range like `22:00-06:00` wraps
/// midnight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleContext {
    #[serde(default)]
    pub allowed_days: Option<Vec<String>>,
    /// `HH:MM-HH:MM`.
    #[serde(default)]
    pub allowed_time: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Outcome of evaluating one rule against an agent's skill set.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    /// The rule matched; carries the skill ids that satisfied it.
    Matched(HashSet<String>),
    NotMatched,
    /// A forbidden skill was declared; the rule can never match.
    Forbidden(String),
}

impl SkillMatchRule {
    /// A rule with neither `requiredSkills` nor `anySkills` never matches.
    pub fn can_match(&self) -> bool {
        !self.required_skills.is_empty() || !self.any_skills.is_empty()
    }

    /// Evaluate this rule. `strict` controls whether bad time ranges or
    /// zones fail the resolve (strict) or degrade with a warning.
    pub fn evaluate(
        &self,
        agent_skills: &HashSet<String>,
        now: DateTime<Utc>,
        strict: bool,
    ) -> GatewayResult<RuleOutcome> {
        if let Some(hit) = self
            .forbidden_skills
            .iter()
            .find(|s| agent_skills.contains(s.as_str()))
        {
            return Ok(RuleOutcome::Forbidden(hit.clone()));
        }

        if let Some(ctx) = &self.context {
            if !ctx.is_active(now, strict)? {
                return Ok(RuleOutcome::NotMatched);
            }
        }

        let mut matched: HashSet<String> = HashSet::new();

        if !self.required_skills.is_empty() {
            for id in &self.required_skills {
                if !agent_skills.contains(id) {
                    return Ok(RuleOutcome::NotMatched);
                }
                matched.insert(id.clone());
            }
        }

        if !self.any_skills.is_empty() {
            let present: Vec<&String> = self
                .any_skills
                .iter()
                .filter(|s| agent_skills.contains(s.as_str()))
                .collect();
            if present.len() < self.min_skill_match.max(1) {
                return Ok(RuleOutcome::NotMatched);
            }
            matched.extend(present.into_iter().cloned());
        }

        if matched.is_empty() {
            // Neither condition set anything to match on.
            return Ok(RuleOutcome::NotMatched);
        }

        Ok(RuleOutcome::Matched(matched))
    }

    /// Validate the rule's time-window context eagerly, as strict
    /// loading would. Used by configuration checks.
    pub fn validate(&self) -> GatewayResult<()> {
        let Some(ctx) = &self.context else {
            return Ok(());
        };
        if let Some(range) = &ctx.allowed_time {
            parse_time_range(range)?;
        }
        if let Some(zone) = &ctx.timezone {
            if zone.parse::<Tz>().is_err() {
                return Err(GatewayError::InvalidTimeZone(zone.clone()));
            }
        }
        Ok(())
    }

    /// Canonical identity used to deduplicate rules aggregated from
    /// skills: role plus sorted required/any sets.
    pub fn dedup_key(&self) -> String {
        let mut required = self.required_skills.clone();
        required.sort();
        let mut any = self.any_skills.clone();
        any.sort();
        format!("{}|{}|{}", self.role, required.join(","), any.join(","))
    }
}

impl RuleContext {
    /// Whether the window admits `now`. Invalid zones and time ranges are
    /// errors in strict mode; otherwise the zone falls back to the system
    /// zone and an unparseable range fails open.
    pub fn is_active(&self, now: DateTime<Utc>, strict: bool) -> GatewayResult<bool> {
        let (weekday, time_of_day) = match self.local_now(now, strict)? {
            Some(parts) => parts,
            None => return Ok(true),
        };

        if let Some(days) = &self.allowed_days {
            if !days.is_empty() {
                let today_ok = days.iter().any(|d| parse_weekday(d) == Some(weekday));
                if !today_ok {
                    return Ok(false);
                }
            }
        }

        if let Some(range) = &self.allowed_time {
            match parse_time_range(range) {
                Ok((start, end)) => {
                    let inside = if start <= end {
                        time_of_day >= start && time_of_day <= end
                    } else {
                        // Overnight ranges wrap midnight.
                        time_of_day >= start || time_of_day <= end
                    };
                    if !inside {
                        return Ok(false);
                    }
                }
                Err(e) => {
                    if strict {
                        return Err(e);
                    }
                    warn!("Ignoring invalid time range '{}': {}", range, e);
                }
            }
        }

        Ok(true)
    }

    /// Current weekday and wall-clock time in the rule's zone. `None`
    /// when no constraint needs them.
    fn local_now(
        &self,
        now: DateTime<Utc>,
        strict: bool,
    ) -> GatewayResult<Option<(Weekday, NaiveTime)>> {
        if self.allowed_days.is_none() && self.allowed_time.is_none() {
            return Ok(None);
        }

        if let Some(zone) = &self.timezone {
            match zone.parse::<Tz>() {
                Ok(tz) => {
                    let local = now.with_timezone(&tz);
                    return Ok(Some((local.weekday(), naive_time_of(&local))));
                }
                Err(_) => {
                    if strict {
                        return Err(GatewayError::InvalidTimeZone(zone.clone()));
                    }
                    warn!("Unknown time zone '{}', using system zone", zone);
                }
            }
        }

        let local = now.with_timezone(&chrono::Local);
        Ok(Some((local.weekday(), naive_time_of(&local))))
    }
}

fn naive_time_of<T: Timelike>(t: &T) -> NaiveTime {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), t.second()).unwrap_or_default()
}

/// Parse `HH:MM-HH:MM` into a start/end pair.
pub fn parse_time_range(range: &str) -> GatewayResult<(NaiveTime, NaiveTime)> {
    let invalid = || GatewayError::InvalidTimeRange(range.to_string());
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let parse = |s: &str| -> GatewayResult<NaiveTime> {
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour: u32 = h.parse().map_err(|_| invalid())?;
        let minute: u32 = m.parse().map_err(|_| invalid())?;
        NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
    };
    Ok((parse(start)?, parse(end)?))
}

fn parse_weekday(day: &str) -> Option<Weekday> {
    match day.trim().to_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tues" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thur" | "thurs" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}
