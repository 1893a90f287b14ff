use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::functions::serializer::ChannelSerializer;
use crate::schema::{Contact, OutboundMessage, ScheduleStatus, ScheduledMessage};
use crate::services::{
    DeliveryReceipt, MessageTransport, Notifier, ScheduleStore, TicketResolver,
};

struct SentDelivery {
    receipt: DeliveryReceipt,
    ticket_id: Option<Uuid>,
    sent_at: chrono::DateTime<Utc>,
}

/// The single choke point for sends. Every execution path (durable job,
/// fallback timer, sweeper re-arm) funnels into `deliver`, which decides
/// from the persisted row whether a send may still happen.
pub struct DeliveryExecutor {
    config: Arc<Config>,
    store: Arc<dyn ScheduleStore>,
    transport: Arc<dyn MessageTransport>,
    tickets: Arc<dyn TicketResolver>,
    notifier: Arc<dyn Notifier>,
    serializer: ChannelSerializer,
}

impl DeliveryExecutor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ScheduleStore>,
        transport: Arc<dyn MessageTransport>,
        tickets: Arc<dyn TicketResolver>,
        notifier: Arc<dyn Notifier>,
        serializer: ChannelSerializer,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            tickets,
            notifier,
            serializer,
        }
    }

    /// Perform exactly one delivery attempt for a schedule. Ineligible
    /// invocations (row gone, already sent, not pending, not yet due) are
    /// silent no-ops so duplicate fires stay harmless. A send failure on
    /// the last attempt marks the schedule `error`; earlier attempts
    /// leave it pending for the job layer's retry.
    pub async fn deliver(
        &self,
        schedule_id: Uuid,
        company_id: Uuid,
        final_attempt: bool,
    ) -> Result<()> {
        let Some(schedule) = self.store.get(schedule_id, company_id).await? else {
            tracing::debug!(schedule_id = %schedule_id, "delivery: schedule gone, nothing to do");
            return Ok(());
        };
        if schedule.sent_at.is_some() {
            tracing::debug!(schedule_id = %schedule_id, "delivery: already delivered");
            return Ok(());
        }
        if schedule.status != ScheduleStatus::Pending {
            tracing::debug!(
                schedule_id = %schedule_id,
                status = %schedule.status,
                "delivery: not eligible"
            );
            return Ok(());
        }
        if Utc::now() < schedule.send_at {
            tracing::debug!(
                schedule_id = %schedule_id,
                send_at = %schedule.send_at,
                "delivery: fired early, not yet due"
            );
            return Ok(());
        }

        let Some(contact) = self.store.contact(schedule.contact_id, company_id).await? else {
            // a deleted contact cannot heal on retry
            tracing::warn!(
                schedule_id = %schedule_id,
                contact_id = %schedule.contact_id,
                "delivery: contact missing, marking error"
            );
            self.store.mark_error(schedule_id, company_id).await?;
            self.notifier
                .publish(
                    "schedule_error",
                    serde_json::json!({
                        "schedule_id": schedule_id,
                        "company_id": company_id,
                        "error": "contact missing",
                    }),
                )
                .await;
            return Ok(());
        };

        let address = match self.resolve_address(&contact).await {
            Ok(address) => address,
            Err(err) => return self.fail(&schedule, final_attempt, err).await,
        };

        match self.send_exclusive(&schedule, &contact, &address).await {
            Ok(Some(sent)) => {
                self.finish(&schedule, &contact, sent).await;
                Ok(())
            }
            // a duplicate fire delivered while this task waited its turn
            Ok(None) => {
                tracing::debug!(schedule_id = %schedule_id, "delivery: superseded in channel queue");
                Ok(())
            }
            Err(err) => self.fail(&schedule, final_attempt, err).await,
        }
    }

    /// Individual contacts send to their cached channel address (or raw
    /// number). Group contacts need a structural group id; when the
    /// stored value is not one, the channel is asked for the group by
    /// subject and the answer is cached on the contact.
    async fn resolve_address(&self, contact: &Contact) -> anyhow::Result<String> {
        if !contact.is_group {
            return Ok(contact
                .remote_address
                .clone()
                .unwrap_or_else(|| contact.number.clone()));
        }

        if let Some(address) = contact.remote_address.as_deref()
            && self.config.is_group_address(address)
        {
            return Ok(address.to_string());
        }

        let resolved = self
            .transport
            .find_group_by_subject(&contact.name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no group found with subject {:?}", contact.name))?;

        if let Err(err) = self
            .store
            .save_contact_address(contact.id, contact.company_id, &resolved)
            .await
        {
            tracing::warn!(
                contact_id = %contact.id,
                error = %err,
                "delivery: could not cache resolved group address"
            );
        }
        Ok(resolved)
    }

    /// Send while holding the channel's slot. The eligibility re-check
    /// and the `mark_sent` transition both happen under the lock, so a
    /// duplicate invocation queued behind this one always observes the
    /// sent flag and backs off. Returns `None` when the re-check shows
    /// the schedule was already handled.
    async fn send_exclusive(
        &self,
        schedule: &ScheduledMessage,
        contact: &Contact,
        address: &str,
    ) -> anyhow::Result<Option<SentDelivery>> {
        let timeout = self.config.send_timeout;
        self.serializer
            .run_exclusive(contact.channel_id, async {
                match self.store.get(schedule.id, schedule.company_id).await? {
                    Some(current)
                        if current.sent_at.is_none()
                            && current.status == ScheduleStatus::Pending => {}
                    _ => return Ok(None),
                }

                let receipt = match tokio::time::timeout(
                    timeout,
                    self.transport.send(address, &schedule.body),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) => anyhow::bail!("send timed out after {timeout:?}"),
                };

                // the ticket is best-effort context; the message is out
                let ticket_id = match self.tickets.find_or_create(contact).await {
                    Ok(ticket) => Some(ticket.id),
                    Err(err) => {
                        tracing::warn!(
                            schedule_id = %schedule.id,
                            error = %err,
                            "delivery: ticket resolution failed"
                        );
                        None
                    }
                };

                let sent_at = Utc::now();
                let updated = self
                    .store
                    .mark_sent(schedule.id, schedule.company_id, sent_at, ticket_id)
                    .await?;
                if !updated {
                    tracing::warn!(schedule_id = %schedule.id, "delivery: sent flag was already set");
                }

                Ok(Some(SentDelivery {
                    receipt,
                    ticket_id,
                    sent_at,
                }))
            })
            .await
    }

    /// Post-send bookkeeping, off the channel lock: audit record and
    /// observer notification. Neither may undo a delivery that already
    /// happened, so failures here are logged and swallowed.
    async fn finish(&self, schedule: &ScheduledMessage, contact: &Contact, sent: SentDelivery) {
        let record = OutboundMessage::for_schedule(
            schedule.id,
            sent.ticket_id,
            contact.id,
            schedule.company_id,
            schedule.body.clone(),
            Some(sent.receipt.external_id.clone()),
        );
        if let Err(err) = self.store.record_outbound(&record).await {
            tracing::warn!(
                schedule_id = %schedule.id,
                error = %err,
                "delivery: outbound audit insert failed"
            );
        }

        self.notifier
            .publish(
                "schedule_sent",
                serde_json::json!({
                    "schedule_id": schedule.id,
                    "company_id": schedule.company_id,
                    "ticket_id": sent.ticket_id,
                    "sent_at": sent.sent_at,
                    "external_id": sent.receipt.external_id,
                }),
            )
            .await;

        tracing::info!(
            schedule_id = %schedule.id,
            contact_id = %contact.id,
            ticket_id = ?sent.ticket_id,
            "delivery: message sent"
        );
    }

    async fn fail(
        &self,
        schedule: &ScheduledMessage,
        final_attempt: bool,
        err: anyhow::Error,
    ) -> Result<()> {
        tracing::warn!(
            schedule_id = %schedule.id,
            final_attempt,
            error = %err,
            "delivery: send failed"
        );
        if final_attempt {
            self.store
                .mark_error(schedule.id, schedule.company_id)
                .await?;
        }
        self.notifier
            .publish(
                "schedule_error",
                serde_json::json!({
                    "schedule_id": schedule.id,
                    "company_id": schedule.company_id,
                    "error": err.to_string(),
                }),
            )
            .await;
        Err(Error::DeliveryFailed(err.to_string()))
    }
}
