use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use consent_core::{
    AccessDisplayStatus, AccessRequest, AccessRequestId, Actor, ConsentService, GrantOutcome,
    NewAccessRequest, NewTransferRequest, Principal, RecordId, Role, ServiceSettings,
    TransferQuery, TransferRequest, TransferRequestId, UploadRecord, Urgency,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "consent")]
#[command(about = "Consent-gated medical record access CLI")]
struct Cli {
    /// Principal performing the command
    #[arg(long = "as", global = true)]
    principal: Option<Principal>,
    /// Role of that principal (patient, doctor or admin)
    #[arg(long, global = true)]
    role: Option<Role>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransferSlice {
    Incoming,
    Outgoing,
    Actionable,
    History,
}

impl From<TransferSlice> for TransferQuery {
    fn from(slice: TransferSlice) -> Self {
        match slice {
            TransferSlice::Incoming => TransferQuery::Incoming,
            TransferSlice::Outgoing => TransferQuery::Outgoing,
            TransferSlice::Actionable => TransferQuery::Actionable,
            TransferSlice::History => TransferQuery::History,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the identity directory
    Identities,
    /// List records owned by, or shared with, the caller
    Records,
    /// Seal and store a file as a record
    Upload {
        /// File to upload
        file: PathBuf,
        /// Record title
        #[arg(long)]
        title: String,
        /// Record type tag, e.g. lab-result
        #[arg(long = "type")]
        record_type: String,
        /// Owning patient (defaults to the caller)
        #[arg(long)]
        patient: Option<Principal>,
        /// Mime type (detected from content when omitted)
        #[arg(long)]
        mime: Option<String>,
        /// Extra principals to authorise at upload
        #[arg(long, value_delimiter = ',')]
        share_with: Vec<Principal>,
    },
    /// Write a record's ciphertext to a file
    Fetch {
        record: RecordId,
        /// Output path
        #[arg(long)]
        out: PathBuf,
    },
    /// Delete a record the caller owns
    DeleteRecord { record: RecordId },
    /// Ask a patient for access to their records
    RequestAccess {
        #[arg(long)]
        patient: Principal,
        /// Record ids (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        records: Vec<RecordId>,
        #[arg(long)]
        purpose: String,
        #[arg(long, default_value = "routine")]
        urgency: Urgency,
        /// Requested access duration in days
        #[arg(long)]
        duration_days: Option<u32>,
        /// Save without sending
        #[arg(long)]
        draft: bool,
    },
    /// Send a draft access request
    SendRequest { id: AccessRequestId },
    /// Approve an access request
    ApproveRequest {
        id: AccessRequestId,
        /// Explicit expiry (RFC 3339)
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Deny an access request
    DenyRequest {
        id: AccessRequestId,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Revoke an approved access request
    RevokeRequest { id: AccessRequestId },
    /// Re-run grant delivery for an approved request
    RetryRequest { id: AccessRequestId },
    /// List access requests involving the caller
    AccessRequests {
        /// Display status filter
        #[arg(long)]
        status: Option<AccessDisplayStatus>,
    },
    /// Ask another doctor to send a patient's document
    RequestTransfer {
        #[arg(long)]
        patient: Principal,
        /// Doctor holding the document
        #[arg(long)]
        source: Principal,
        #[arg(long)]
        description: String,
        #[arg(long)]
        purpose: String,
        #[arg(long, default_value = "routine")]
        urgency: Urgency,
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Decline a transfer as the source doctor
    RejectTransfer {
        id: TransferRequestId,
        #[arg(long)]
        reason: String,
    },
    /// Attach an uploaded record to a transfer
    AttachTransfer {
        id: TransferRequestId,
        #[arg(long)]
        record: RecordId,
        #[arg(long)]
        title: Option<String>,
    },
    /// Approve a transfer as the patient
    ApproveTransfer { id: TransferRequestId },
    /// Deny a transfer as the patient
    DenyTransfer {
        id: TransferRequestId,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Retry a failed transfer grant
    RetryTransfer { id: TransferRequestId },
    /// List transfers
    Transfers {
        #[arg(value_enum)]
        slice: TransferSlice,
    },
}

fn actor(cli: &Cli) -> anyhow::Result<Actor> {
    match (&cli.principal, cli.role) {
        (Some(principal), Some(role)) => Ok(Actor::new(principal.clone(), role)),
        _ => bail!("this command needs --as <principal> and --role <role>"),
    }
}

fn print_access(request: &AccessRequest) {
    let now = Utc::now();
    println!(
        "ID: {}, Patient: {}, Doctor: {}, Status: {}, Records: {}",
        request.id,
        request.patient,
        request.doctor,
        request.display_status(now),
        request.requested_titles.join("; ")
    );
    if let Some(report) = &request.last_delivery {
        println!(
            "  Delivery: {} ({} ok, {} failed)",
            report.summary().as_str(),
            report.success_count,
            report.fail_count
        );
        for result in &report.results {
            if let GrantOutcome::Failed { reason, retriable } = &result.outcome {
                println!("  {}: {} (retriable: {})", result.record_id, reason, retriable);
            }
        }
    }
}

fn print_transfer(request: &TransferRequest) {
    println!(
        "ID: {}, Patient: {}, From: {}, To: {}, Phase: {:?}, Description: {}",
        request.id,
        request.patient,
        request.source_doctor,
        request.requesting_doctor,
        request.phase(Utc::now()),
        request.description
    );
    if let Some(reason) = &request.failure_reason {
        println!("  Failure: {reason}");
    }
}

async fn run(cli: &Cli, command: &Commands, service: &ConsentService) -> anyhow::Result<()> {
    match command {
        Commands::Identities => {
            let identities = service.identities().list()?;
            if identities.is_empty() {
                println!("No identities found.");
            }
            for identity in identities {
                println!(
                    "Principal: {}, Role: {}, Name: {}, Organisation: {}",
                    identity.principal,
                    identity.role,
                    identity.display_name,
                    identity.organization.map(|o| o.to_string()).unwrap_or_default()
                );
            }
        }
        Commands::Records => {
            let records = service.list_records(&actor(cli)?)?;
            if records.is_empty() {
                println!("No records found.");
            }
            for record in records {
                println!(
                    "ID: {}, Title: {}, Type: {}, Patient: {}, Shared with: {}",
                    record.id,
                    record.title,
                    record.record_type,
                    record.patient,
                    record
                        .policy
                        .members()
                        .map(|m| m.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        }
        Commands::Upload {
            file,
            title,
            record_type,
            patient,
            mime,
            share_with,
        } => {
            let actor = actor(cli)?;
            let content = std::fs::read(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let record = service
                .upload_record(
                    &actor,
                    UploadRecord {
                        patient: patient.clone().unwrap_or_else(|| actor.principal.clone()),
                        title: title.clone(),
                        record_type: record_type.clone(),
                        content,
                        mime_type: mime.clone(),
                        co_authorized: share_with.clone(),
                    },
                )
                .await?;
            println!("Uploaded record with ID: {}", record.id);
        }
        Commands::Fetch { record, out } => {
            let fetched = service.fetch_ciphertext(&actor(cli)?, record).await?;
            std::fs::write(out, &fetched.ciphertext)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!(
                "Wrote {} bytes of ciphertext; wrapped key: {}",
                fetched.ciphertext.len(),
                fetched.record.wrapped_key.to_base64()
            );
        }
        Commands::DeleteRecord { record } => {
            let report = service.delete_record(&actor(cli)?, record).await?;
            println!(
                "Deleted record {}; flagged {} access and {} transfer requests",
                report.record_id, report.access_requests_flagged, report.transfer_requests_flagged
            );
        }
        Commands::RequestAccess {
            patient,
            records,
            purpose,
            urgency,
            duration_days,
            draft,
        } => {
            let actor = actor(cli)?;
            let new = NewAccessRequest {
                patient: patient.clone(),
                record_ids: records.clone(),
                purpose: purpose.clone(),
                urgency: *urgency,
                requested_duration_days: *duration_days,
            };
            let request = if *draft {
                service.create_access_draft(&actor, new)?
            } else {
                service.create_access_request(&actor, new)?
            };
            print_access(&request);
        }
        Commands::SendRequest { id } => {
            print_access(&service.send_access_request(&actor(cli)?, id)?);
        }
        Commands::ApproveRequest { id, expires_at } => {
            let request = service
                .approve_access_request(&actor(cli)?, id, *expires_at)
                .await?;
            print_access(&request);
        }
        Commands::DenyRequest { id, reason } => {
            print_access(&service.deny_access_request(&actor(cli)?, id, reason.as_deref())?);
        }
        Commands::RevokeRequest { id } => {
            let (request, report) = service.revoke_access_request(&actor(cli)?, id).await?;
            print_access(&request);
            println!(
                "Resealed {} records without the doctor ({} failed)",
                report.success_count, report.fail_count
            );
        }
        Commands::RetryRequest { id } => {
            print_access(&service.retry_access_grants(&actor(cli)?, id).await?);
        }
        Commands::AccessRequests { status } => {
            let requests = service.access_requests_for(&actor(cli)?, *status)?;
            if requests.is_empty() {
                println!("No access requests found.");
            }
            requests.iter().for_each(print_access);
        }
        Commands::RequestTransfer {
            patient,
            source,
            description,
            purpose,
            urgency,
            expires_at,
        } => {
            let request = service.create_transfer_request(
                &actor(cli)?,
                NewTransferRequest {
                    patient: patient.clone(),
                    source_doctor: source.clone(),
                    description: description.clone(),
                    purpose: purpose.clone(),
                    urgency: *urgency,
                    expires_at: *expires_at,
                },
            )?;
            print_transfer(&request);
        }
        Commands::RejectTransfer { id, reason } => {
            print_transfer(&service.reject_transfer(&actor(cli)?, id, reason)?);
        }
        Commands::AttachTransfer { id, record, title } => {
            let request =
                service.attach_transfer_upload(&actor(cli)?, id, record, title.as_deref())?;
            print_transfer(&request);
        }
        Commands::ApproveTransfer { id } => {
            print_transfer(&service.approve_transfer(&actor(cli)?, id).await?);
        }
        Commands::DenyTransfer { id, reason } => {
            print_transfer(&service.deny_transfer(&actor(cli)?, id, reason.as_deref())?);
        }
        Commands::RetryTransfer { id } => {
            print_transfer(&service.retry_transfer_grant(&actor(cli)?, id).await?);
        }
        Commands::Transfers { slice } => {
            let requests = service.transfers_for(&actor(cli)?, (*slice).into())?;
            if requests.is_empty() {
                println!("No transfer requests found.");
            }
            requests.iter().for_each(print_transfer);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let Some(command) = &cli.command else {
        println!("Use 'consent --help' for commands");
        return Ok(());
    };

    let settings = ServiceSettings::from_lookup(|name| std::env::var(name).ok())?;
    let service = settings.build()?;
    run(&cli, command, &service).await?;
    service.persist()?;
    Ok(())
}
