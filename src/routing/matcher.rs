use std::sync::Arc;

use tracing::{debug, warn};

use crate::db::{Bot, ChannelBot, Conversation, DatabaseManager};
use crate::tenant::TenantScope;

use super::RoutingError;
use super::triggers::{EventAttributes, TriggerExpr};

#[derive(Debug, Clone)]
pub struct BotMatch {
    pub binding: ChannelBot,
    pub bot: Bot,
}

pub struct BotTriggerMatcher {
    db_manager: Arc<DatabaseManager>,
}

impl BotTriggerMatcher {
    pub fn new(db_manager: Arc<DatabaseManager>) -> Self {
        Self { db_manager }
    }

    /// First active rule on the conversation's channel whose predicate holds.
    pub async fn find_match(
        &self,
        scope: &TenantScope,
        conversation: &Conversation,
        attributes: &EventAttributes,
    ) -> Result<Option<BotMatch>, RoutingError> {
        let rules = self
            .db_manager
            .tenant_store()
            .list_active_channel_bots(scope, conversation.channel_id)
            .await?;
        for (binding, bot) in &rules {
            scope.ensure_owns("channel_bot", binding.company_id)?;
            scope.ensure_owns("bot", bot.company_id)?;
        }

        let matched = first_match(rules, attributes);
        match &matched {
            Some(found) => debug!(
                "conversation_id={} matched bot_id={} via channel_bot_id={}",
                conversation.id, found.bot.id, found.binding.id
            ),
            None => debug!("conversation_id={} matched no bot", conversation.id),
        }
        Ok(matched)
    }
}

/// First-match-wins over rules in `(created_at, id)` order. A rule that does
/// not compile is skipped.
pub fn first_match(mut rules: Vec<(ChannelBot, Bot)>, attributes: &EventAttributes) -> Option<BotMatch> {
    rules.sort_by(|(a, _), (b, _)| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    rules.into_iter().find_map(|(binding, bot)| {
        if !binding.is_active || !bot.is_active {
            return None;
        }
        let expr = match TriggerExpr::compile(&binding.trigger_conditions) {
            Ok(expr) => expr,
            Err(err) => {
                warn!(
                    "skipping channel_bot_id={} with invalid trigger: {}",
                    binding.id, err
                );
                return None;
            }
        };
        expr.evaluate(attributes)
            .then_some(BotMatch { binding, bot })
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::{Value, json};

    use super::{BotTriggerMatcher, first_match};
    use crate::db::testing::TestDatabase;
    use crate::db::{Bot, ChannelBot};
    use crate::routing::triggers::EventAttributes;

    fn rule(id: i64, age_secs: i64, trigger: Value) -> (ChannelBot, Bot) {
        let created_at = Utc::now() - Duration::seconds(age_secs);
        (
            ChannelBot {
                id,
                company_id: 1,
                channel_id: 1,
                bot_id: id * 10,
                trigger_conditions: trigger,
                is_active: true,
                created_at,
            },
            Bot {
                id: id * 10,
                company_id: 1,
                name: format!("bot-{id}"),
                is_active: true,
                flow_data: json!({}),
                created_at,
                updated_at: created_at,
            },
        )
    }

    fn text(body: &str) -> EventAttributes {
        let mut attributes = EventAttributes::new();
        attributes.insert("message.text", json!(body));
        attributes
    }

    #[test]
    fn earliest_matching_rule_wins() {
        let rules = vec![
            rule(3, 10, json!(null)),
            rule(2, 20, json!({"field": "message.text", "op": "contains", "value": "refund"})),
            rule(1, 30, json!({"field": "message.text", "op": "contains", "value": "order"})),
        ];
        let found = first_match(rules.clone(), &text("refund my order")).expect("match");
        assert_eq!(found.bot.id, 10);

        let found = first_match(rules, &text("refund please")).expect("match");
        assert_eq!(found.bot.id, 20);
    }

    #[test]
    fn ties_on_created_at_break_by_id() {
        let (mut second, second_bot) = rule(8, 0, json!(true));
        let (first, first_bot) = rule(4, 0, json!(true));
        second.created_at = first.created_at;
        let found = first_match(vec![(second, second_bot), (first, first_bot)], &text("hi"))
            .expect("match");
        assert_eq!(found.binding.id, 4);
    }

    #[test]
    fn invalid_rule_is_skipped() {
        let rules = vec![
            rule(1, 30, json!({"field": "message.text", "op": "matches", "value": "("})),
            rule(2, 20, json!({"field": "message.text", "op": "contains", "value": "hi"})),
        ];
        assert_eq!(first_match(rules, &text("hi")).expect("match").bot.id, 20);
    }

    #[test]
    fn no_rule_matches() {
        let rules = vec![rule(1, 30, json!({"field": "message.text", "value": "menu"}))];
        assert!(first_match(rules, &text("hello")).is_none());
    }

    #[test]
    fn same_input_same_answer() {
        let rules = vec![
            rule(1, 30, json!({"field": "message.text", "op": "contains", "value": "x"})),
            rule(2, 20, json!(null)),
        ];
        let attributes = text("abc");
        let answers: Vec<_> = (0..10)
            .map(|_| first_match(rules.clone(), &attributes).map(|m| m.bot.id))
            .collect();
        assert!(answers.iter().all(|a| *a == Some(20)));
    }

    #[tokio::test]
    async fn loads_only_active_rules_for_the_channel() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let conversation = db.open_conversation(&tenant, "+15550001").await;
        let channel = db
            .manager
            .tenant_store()
            .get_channel(&tenant.scope, conversation.channel_id)
            .await
            .expect("load")
            .expect("channel");
        let sales = db.bot(&tenant, "sales").await;
        let support = db.bot(&tenant, "support").await;
        let disabled = db.bind(&tenant, &channel, &sales, json!(true)).await;
        db.bind(&tenant, &channel, &support, json!(true)).await;
        db.manager
            .tenant_store()
            .set_channel_bot_active(&tenant.scope, disabled.id, false)
            .await
            .expect("disable");

        let matcher = BotTriggerMatcher::new(db.manager.clone());
        let found = matcher
            .find_match(&tenant.scope, &conversation, &text("hi"))
            .await
            .expect("match")
            .expect("some bot");
        assert_eq!(found.bot.id, support.id);
    }
}
