//! Request context population
//!
//! Resolves the target and global services, asserts the subject's token,
//! builds the condition attributes and the subject's effective principals.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::decision::{RequestContext, Subject};
use crate::cel::context::{
    ATTR_ACTION, ATTR_ENTITY, ATTR_GROUPS, ATTR_RESOURCE, ATTR_USER,
};
use crate::cel::EvalContext;
use crate::error::{AuthzError, Result};
use crate::principal::{
    role_principal, ANONYMOUS_ROLE, AUTHENTICATED_ROLE, EVERYONE_ROLE, PRINCIPAL_TYPE_ENTITY,
    PRINCIPAL_TYPE_GROUP, PRINCIPAL_TYPE_USER,
};
use crate::runtime::{RuntimeService, StoreState};
use crate::types::GLOBAL_SERVICE;

/// Checks a subject's identity token
///
/// Called at most once per request, only for a subject carrying an
/// unasserted token. Implementations may add principals to the subject.
pub trait TokenAsserter: Send + Sync {
    /// Validate the token of `subject`
    fn assert_token(&self, subject: &mut Subject) -> Result<()>;
}

impl<F> TokenAsserter for F
where
    F: Fn(&mut Subject) -> Result<()> + Send + Sync,
{
    fn assert_token(&self, subject: &mut Subject) -> Result<()> {
        self(subject)
    }
}

/// A request resolved against the runtime store
pub(crate) struct PopulatedRequest {
    pub service: Arc<RuntimeService>,
    pub global: Option<Arc<RuntimeService>>,
    pub resource: String,
    pub action: String,
    /// Effective principals, before role resolution
    pub principals: Vec<String>,
    pub attributes: EvalContext,
    /// Subject after token assertion
    pub subject: Option<Subject>,
}

#[derive(Default)]
struct ClassifiedPrincipals {
    users: Vec<String>,
    groups: Vec<String>,
    entities: Vec<String>,
}

pub(crate) fn populate(
    state: &StoreState,
    request: &RequestContext,
    asserter: Option<&dyn TokenAsserter>,
) -> Result<PopulatedRequest> {
    let service = state
        .service(&request.service_name)
        .cloned()
        .ok_or_else(|| AuthzError::ServiceNotFound(request.service_name.clone()))?;

    let mut subject = request.subject.clone();
    if let (Some(subject), Some(asserter)) = (subject.as_mut(), asserter) {
        if subject.needs_assertion() {
            assert_subject(asserter, subject)?;
        }
    }

    let global = if request.service_name == GLOBAL_SERVICE {
        None
    } else {
        state.global().cloned()
    };

    let mut attributes = EvalContext::new().with_time_now();
    let classified = match &subject {
        Some(subject) => classify(subject, &mut attributes),
        None => ClassifiedPrincipals::default(),
    };
    attributes.set(ATTR_RESOURCE, Value::from(request.resource.clone()));
    attributes.set(ATTR_ACTION, Value::from(request.action.clone()));
    attributes.merge(&request.attributes);

    Ok(PopulatedRequest {
        service,
        global,
        resource: request.resource.clone(),
        action: request.action.clone(),
        principals: effective_principals(classified),
        attributes,
        subject,
    })
}

fn assert_subject(asserter: &dyn TokenAsserter, subject: &mut Subject) -> Result<()> {
    match asserter.assert_token(subject) {
        Ok(()) => {
            subject.asserted = true;
            debug!(token_type = %subject.token_type, "Asserted subject token");
            Ok(())
        }
        Err(e) => {
            warn!(token_type = %subject.token_type, error = %e, "Token assertion failed");
            Err(match e {
                AuthzError::TokenAssertion(_) => e,
                other => AuthzError::TokenAssertion(other.to_string()),
            })
        }
    }
}

/// Sort principals into users, groups and entities and set the subject
/// attributes
fn classify(subject: &Subject, attributes: &mut EvalContext) -> ClassifiedPrincipals {
    let mut classified = ClassifiedPrincipals::default();
    let mut user: Option<&str> = None;
    let mut entity: Option<&str> = None;
    let mut group_names = Vec::new();

    for principal in &subject.principals {
        let bucket = match principal.kind.as_str() {
            PRINCIPAL_TYPE_USER => {
                if user.is_none() {
                    user = Some(principal.name.as_str());
                }
                &mut classified.users
            }
            PRINCIPAL_TYPE_GROUP => {
                group_names.push(Value::from(principal.name.clone()));
                &mut classified.groups
            }
            PRINCIPAL_TYPE_ENTITY => {
                if entity.is_none() {
                    entity = Some(principal.name.as_str());
                }
                &mut classified.entities
            }
            // Roles come from role resolution only
            _ => continue,
        };
        bucket.push(principal.encode());
        if !principal.idd.is_empty() {
            bucket.push(principal.encode_without_idd());
        }
    }

    if let Some(user) = user {
        attributes.set(ATTR_USER, Value::from(user));
    }
    attributes.set(ATTR_GROUPS, Value::Array(group_names));
    if let Some(entity) = entity {
        attributes.set(ATTR_ENTITY, Value::from(entity));
    }
    classified
}

/// Built-in roles plus the classified principals
fn effective_principals(classified: ClassifiedPrincipals) -> Vec<String> {
    let ClassifiedPrincipals {
        users,
        groups,
        entities,
    } = classified;

    let mut principals = vec![role_principal(EVERYONE_ROLE)];
    if users.is_empty() && groups.is_empty() && entities.is_empty() {
        principals.push(role_principal(ANONYMOUS_ROLE));
    } else {
        principals.extend(users);
        principals.extend(entities);
        principals.push(role_principal(AUTHENTICATED_ROLE));
    }
    principals.extend(groups);
    principals
}
