//! Directory reads and admin writes.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info, warn};

use super::DatabaseManager;
use crate::directory::{
    next_extension, sip_uri, Account, CrmUser, DistributionStrategy, Group, GroupId, GroupMember,
    InternalNumber, NewAccount, NewGroup, NewInternalNumber, NewRoutingRule, NewSipServer, NewUser,
    NumberId, RoutableNumber, RoutingRule, RuleActionKind, RuleId, ServerId, SipServer, UserId,
};
use crate::error::{CallEngineError, Result};

const NUMBER_COLUMNS: &str =
    "n.id, n.server_id, n.number, n.user_id, n.password, n.display_name, n.active, n.auto_generated";

const GROUP_COLUMNS: &str = "id, name, description, server_id, distribution_strategy, ring_timeout, \
     max_queue_size, queue_timeout, active";

const RULE_COLUMNS: &str = "r.id, r.name, r.description, r.priority, r.caller_id_pattern, \
     r.called_number_pattern, r.time_condition, r.action, r.target_number_id, r.target_group_id, \
     r.target_external, r.announcement_text, r.active";

fn user_from_row(row: &SqliteRow) -> Result<CrmUser> {
    Ok(CrmUser {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        active: row.try_get("active")?,
        is_admin: row.try_get("is_admin")?,
    })
}

fn server_from_row(row: &SqliteRow) -> Result<SipServer> {
    Ok(SipServer {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        host: row.try_get("host")?,
        websocket_uri: row.try_get("websocket_uri")?,
        realm: row.try_get("realm")?,
        proxy: row.try_get("proxy")?,
        register_expires: row.try_get("register_expires")?,
        active: row.try_get("active")?,
    })
}

fn number_from_row(row: &SqliteRow) -> Result<InternalNumber> {
    Ok(InternalNumber {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        number: row.try_get("number")?,
        user_id: row.try_get("user_id")?,
        password: row.try_get("password")?,
        display_name: row.try_get("display_name")?,
        active: row.try_get("active")?,
        auto_generated: row.try_get("auto_generated")?,
    })
}

/// Number rows joined with `sip_domain` from their server.
fn routable_from_row(row: &SqliteRow) -> Result<RoutableNumber> {
    let number = number_from_row(row)?;
    let domain: String = row.try_get("sip_domain")?;
    Ok(RoutableNumber {
        sip_uri: sip_uri(&number.number, &domain),
        number,
    })
}

fn account_from_row(row: &SqliteRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        internal_number_id: row.try_get("internal_number_id")?,
        external_caller_id: row.try_get("external_caller_id")?,
        can_make_external_calls: row.try_get("can_make_external_calls")?,
        can_receive_external_calls: row.try_get("can_receive_external_calls")?,
        call_recording_enabled: row.try_get("call_recording_enabled")?,
        voicemail_enabled: row.try_get("voicemail_enabled")?,
        voicemail_email: row.try_get("voicemail_email")?,
        max_concurrent_calls: row.try_get("max_concurrent_calls")?,
        active: row.try_get("active")?,
    })
}

fn group_from_row(row: &SqliteRow) -> Result<Group> {
    let strategy: String = row.try_get("distribution_strategy")?;
    Ok(Group {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        server_id: row.try_get("server_id")?,
        strategy: strategy.parse::<DistributionStrategy>().map_err(|_| {
            CallEngineError::database(format!("invalid distribution strategy in store: {strategy}"))
        })?,
        ring_timeout: row.try_get("ring_timeout")?,
        max_queue_size: row.try_get("max_queue_size")?,
        queue_timeout: row.try_get("queue_timeout")?,
        active: row.try_get("active")?,
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<RoutingRule> {
    let action: String = row.try_get("action")?;
    Ok(RoutingRule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        priority: row.try_get("priority")?,
        caller_id_pattern: row.try_get("caller_id_pattern")?,
        called_number_pattern: row.try_get("called_number_pattern")?,
        time_condition: row.try_get("time_condition")?,
        action: action
            .parse::<RuleActionKind>()
            .map_err(|_| CallEngineError::database(format!("invalid rule action in store: {action}")))?,
        target_number_id: row.try_get("target_number_id")?,
        target_group_id: row.try_get("target_group_id")?,
        target_external: row.try_get("target_external")?,
        announcement_text: row.try_get("announcement_text")?,
        active: row.try_get("active")?,
    })
}

impl DatabaseManager {
    // ---- users -------------------------------------------------------------

    pub async fn create_user(&self, user: NewUser) -> Result<CrmUser> {
        user.validate()?;
        let id = sqlx::query(
            "INSERT INTO crm_users (username, full_name, email, is_admin) VALUES (?, ?, ?, ?)",
        )
        .bind(&user.username)
        .bind(&user.full_name)
        .bind(&user.email)
        .bind(user.is_admin)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        debug!("Created user {} ({})", user.username, id);
        self.get_user(id)
            .await?
            .ok_or_else(|| CallEngineError::internal("user vanished after insert"))
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<CrmUser>> {
        let row = sqlx::query("SELECT * FROM crm_users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn set_user_active(&self, id: UserId, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE crm_users SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CallEngineError::not_found(format!("user {id}")));
        }
        Ok(())
    }

    pub async fn admin_users(&self) -> Result<Vec<CrmUser>> {
        let rows = sqlx::query("SELECT * FROM crm_users WHERE is_admin = 1 AND active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    // ---- SIP servers -------------------------------------------------------

    pub async fn create_sip_server(&self, server: NewSipServer) -> Result<SipServer> {
        server.validate()?;
        let id = sqlx::query(
            "INSERT INTO sip_servers (name, host, websocket_uri, realm, proxy, register_expires)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&server.name)
        .bind(&server.host)
        .bind(&server.websocket_uri)
        .bind(&server.realm)
        .bind(&server.proxy)
        .bind(server.register_expires)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!("📡 Registered SIP server {} ({})", server.name, server.host);
        self.get_sip_server(id)
            .await?
            .ok_or_else(|| CallEngineError::internal("server vanished after insert"))
    }

    pub async fn get_sip_server(&self, id: ServerId) -> Result<Option<SipServer>> {
        let row = sqlx::query("SELECT * FROM sip_servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(server_from_row).transpose()
    }

    // ---- extensions --------------------------------------------------------

    /// Next free extension on `server_id`, starting at `base`.
    pub async fn allocate_extension(&self, server_id: ServerId, base: u32) -> Result<String> {
        let existing: Vec<String> = sqlx::query_scalar("SELECT number FROM internal_numbers WHERE server_id = ?")
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(next_extension(existing.iter().map(String::as_str), base))
    }

    /// Create an extension. When `number` is `None` the allocator picks one
    /// and the record is flagged `auto_generated`.
    pub async fn create_internal_number(&self, new: NewInternalNumber, allocation_base: u32) -> Result<InternalNumber> {
        new.validate()?;
        let server = self
            .get_sip_server(new.server_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("SIP server {}", new.server_id)))?;
        if !server.active {
            return Err(CallEngineError::validation(format!("SIP server {} is inactive", server.id)));
        }

        let mut tx = self.pool.begin().await?;
        let (number, auto_generated) = match new.number {
            Some(number) => (number, false),
            None => {
                let existing: Vec<String> =
                    sqlx::query_scalar("SELECT number FROM internal_numbers WHERE server_id = ?")
                        .bind(new.server_id)
                        .fetch_all(&mut *tx)
                        .await?;
                (next_extension(existing.iter().map(String::as_str), allocation_base), true)
            }
        };

        let id = sqlx::query(
            "INSERT INTO internal_numbers (server_id, number, user_id, password, display_name, auto_generated)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(new.server_id)
        .bind(&number)
        .bind(new.user_id)
        .bind(&new.password)
        .bind(&new.display_name)
        .bind(auto_generated)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        info!("☎️ Created extension {} on server {}", number, server.name);
        self.get_internal_number(id)
            .await?
            .ok_or_else(|| CallEngineError::internal("extension vanished after insert"))
    }

    pub async fn get_internal_number(&self, id: NumberId) -> Result<Option<InternalNumber>> {
        let sql = format!("SELECT {NUMBER_COLUMNS} FROM internal_numbers n WHERE n.id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(number_from_row).transpose()
    }

    pub async fn list_internal_numbers(&self, server_id: ServerId) -> Result<Vec<InternalNumber>> {
        let sql = format!("SELECT {NUMBER_COLUMNS} FROM internal_numbers n WHERE n.server_id = ? ORDER BY n.number");
        let rows = sqlx::query(&sql).bind(server_id).fetch_all(&self.pool).await?;
        rows.iter().map(number_from_row).collect()
    }

    /// Extensions are never deleted, only deactivated.
    pub async fn set_internal_number_active(&self, id: NumberId, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE internal_numbers SET active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CallEngineError::not_found(format!("extension {id}")));
        }
        Ok(())
    }

    /// Bind an extension to a user, or unbind it with `None`.
    pub async fn assign_internal_number(&self, id: NumberId, user_id: Option<UserId>) -> Result<()> {
        let result = sqlx::query("UPDATE internal_numbers SET user_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CallEngineError::not_found(format!("extension {id}")));
        }
        Ok(())
    }

    /// An active extension with its dial URI.
    pub async fn routable_number(&self, id: NumberId) -> Result<Option<RoutableNumber>> {
        let sql = format!(
            "SELECT {NUMBER_COLUMNS}, COALESCE(NULLIF(s.realm, ''), s.host) AS sip_domain
             FROM internal_numbers n
             JOIN sip_servers s ON s.id = n.server_id
             WHERE n.id = ? AND n.active = 1"
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(routable_from_row).transpose()
    }

    /// Active extensions with this exact number whose owner has an active
    /// account.
    pub async fn direct_route_candidates(&self, number: &str) -> Result<Vec<RoutableNumber>> {
        let sql = format!(
            "SELECT {NUMBER_COLUMNS}, COALESCE(NULLIF(s.realm, ''), s.host) AS sip_domain
             FROM internal_numbers n
             JOIN sip_servers s ON s.id = n.server_id
             JOIN accounts a ON a.internal_number_id = n.id
             JOIN crm_users u ON u.id = n.user_id
             WHERE n.number = ? AND n.active = 1 AND a.active = 1 AND u.active = 1
             ORDER BY n.id"
        );
        let rows = sqlx::query(&sql).bind(number).fetch_all(&self.pool).await?;
        rows.iter().map(routable_from_row).collect()
    }

    /// The user bound to an extension, if any.
    pub async fn number_owner(&self, id: NumberId) -> Result<Option<CrmUser>> {
        let row = sqlx::query(
            "SELECT u.* FROM crm_users u JOIN internal_numbers n ON n.user_id = u.id WHERE n.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// Inactive accounts whose user is still active.
    pub async fn inactive_account_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM accounts a JOIN crm_users u ON u.id = a.user_id WHERE a.active = 0 AND u.active = 1",
        )
        .fetch_one(&self.pool)
        .await?)
    }

    // ---- accounts ----------------------------------------------------------

    pub async fn create_account(&self, account: NewAccount) -> Result<Account> {
        account.validate()?;
        let number = self
            .get_internal_number(account.internal_number_id)
            .await?
            .ok_or_else(|| CallEngineError::not_found(format!("extension {}", account.internal_number_id)))?;

        let mut tx = self.pool.begin().await?;
        // The account pins the extension to its user.
        if number.user_id != Some(account.user_id) {
            sqlx::query("UPDATE internal_numbers SET user_id = ? WHERE id = ?")
                .bind(account.user_id)
                .bind(number.id)
                .execute(&mut *tx)
                .await?;
        }
        let id = sqlx::query(
            "INSERT INTO accounts (user_id, internal_number_id, external_caller_id, can_make_external_calls,
                 can_receive_external_calls, call_recording_enabled, voicemail_enabled, voicemail_email,
                 max_concurrent_calls)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account.user_id)
        .bind(account.internal_number_id)
        .bind(&account.external_caller_id)
        .bind(account.can_make_external_calls)
        .bind(account.can_receive_external_calls)
        .bind(account.call_recording_enabled)
        .bind(account.voicemail_enabled)
        .bind(&account.voicemail_email)
        .bind(account.max_concurrent_calls)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        self.get_account(id)
            .await?
            .ok_or_else(|| CallEngineError::internal("account vanished after insert"))
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn account_for_number(&self, number_id: NumberId) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE internal_number_id = ?")
            .bind(number_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn set_account_active(&self, id: i64, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CallEngineError::not_found(format!("account {id}")));
        }
        Ok(())
    }

    // ---- groups ------------------------------------------------------------

    pub async fn create_group(&self, group: NewGroup) -> Result<Group> {
        group.validate()?;
        let id = sqlx::query(
            "INSERT INTO number_groups (name, description, server_id, distribution_strategy, ring_timeout,
                 max_queue_size, queue_timeout)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&group.name)
        .bind(&group.description)
        .bind(group.server_id)
        .bind(group.strategy.as_str())
        .bind(group.ring_timeout)
        .bind(group.max_queue_size)
        .bind(group.queue_timeout)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!("👥 Created group {} ({}, {})", group.name, id, group.strategy);
        self.get_group(id)
            .await?
            .ok_or_else(|| CallEngineError::internal("group vanished after insert"))
    }

    pub async fn get_group(&self, id: GroupId) -> Result<Option<Group>> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM number_groups WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(group_from_row).transpose()
    }

    pub async fn active_groups(&self) -> Result<Vec<Group>> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM number_groups WHERE active = 1 ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(group_from_row).collect()
    }

    pub async fn set_group_active(&self, id: GroupId, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE number_groups SET active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CallEngineError::not_found(format!("group {id}")));
        }
        Ok(())
    }

    /// Append an extension to a group; returns its membership position.
    pub async fn add_group_member(&self, group_id: GroupId, number_id: NumberId) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let position: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) + 1 FROM group_members WHERE group_id = ?")
                .bind(group_id)
                .fetch_one(&mut *tx)
                .await?;
        sqlx::query("INSERT INTO group_members (group_id, internal_number_id, position) VALUES (?, ?, ?)")
            .bind(group_id)
            .bind(number_id)
            .bind(position)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(position)
    }

    pub async fn remove_group_member(&self, group_id: GroupId, number_id: NumberId) -> Result<()> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND internal_number_id = ?")
            .bind(group_id)
            .bind(number_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CallEngineError::not_found(format!("extension {number_id} in group {group_id}")));
        }
        Ok(())
    }

    /// All members in membership order, regardless of availability.
    pub async fn group_members(&self, group_id: GroupId) -> Result<Vec<GroupMember>> {
        self.members_query(group_id, false).await
    }

    /// Members that may receive a call: active extension bound to an active
    /// user who holds an active account.
    pub async fn available_group_members(&self, group_id: GroupId) -> Result<Vec<GroupMember>> {
        self.members_query(group_id, true).await
    }

    async fn members_query(&self, group_id: GroupId, available_only: bool) -> Result<Vec<GroupMember>> {
        let availability = if available_only {
            "AND n.active = 1 AND u.active = 1 AND a.active = 1"
        } else {
            ""
        };
        let sql = format!(
            "SELECT gm.position, {NUMBER_COLUMNS}, COALESCE(NULLIF(s.realm, ''), s.host) AS sip_domain
             FROM group_members gm
             JOIN internal_numbers n ON n.id = gm.internal_number_id
             JOIN sip_servers s ON s.id = n.server_id
             LEFT JOIN crm_users u ON u.id = n.user_id
             LEFT JOIN accounts a ON a.internal_number_id = n.id
             WHERE gm.group_id = ? {availability}
             ORDER BY gm.position, n.id"
        );
        let rows = sqlx::query(&sql).bind(group_id).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<GroupMember> {
                let routable = routable_from_row(row)?;
                Ok(GroupMember {
                    position: row.try_get("position")?,
                    number: routable.number,
                    sip_uri: routable.sip_uri,
                })
            })
            .collect()
    }

    pub async fn add_group_manager(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO group_managers (group_id, user_id) VALUES (?, ?)")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn group_managers(&self, group_id: GroupId) -> Result<Vec<CrmUser>> {
        let rows = sqlx::query(
            "SELECT u.* FROM crm_users u
             JOIN group_managers gm ON gm.user_id = u.id
             WHERE gm.group_id = ? AND u.active = 1
             ORDER BY u.id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    /// Active groups with no members at all.
    pub async fn empty_groups(&self) -> Result<Vec<Group>> {
        let sql = format!(
            "SELECT {GROUP_COLUMNS} FROM number_groups g
             WHERE g.active = 1 AND NOT EXISTS (SELECT 1 FROM group_members gm WHERE gm.group_id = g.id)
             ORDER BY g.id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(group_from_row).collect()
    }

    // ---- routing rules -----------------------------------------------------

    pub async fn create_routing_rule(&self, rule: NewRoutingRule) -> Result<RoutingRule> {
        rule.validate()?;
        let id = sqlx::query(
            "INSERT INTO routing_rules (name, description, priority, caller_id_pattern, called_number_pattern,
                 time_condition, action, target_number_id, target_group_id, target_external, announcement_text,
                 active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.priority)
        .bind(&rule.caller_id_pattern)
        .bind(&rule.called_number_pattern)
        .bind(&rule.time_condition)
        .bind(rule.action.as_str())
        .bind(rule.target_number_id)
        .bind(rule.target_group_id)
        .bind(&rule.target_external)
        .bind(&rule.announcement_text)
        .bind(rule.active)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        let created = self
            .get_routing_rule(id)
            .await?
            .ok_or_else(|| CallEngineError::internal("rule vanished after insert"))?;
        if !created.is_actionable() {
            warn!("Routing rule {} ({}) has no {} target", id, created.name, created.action.as_str());
        }
        Ok(created)
    }

    pub async fn get_routing_rule(&self, id: RuleId) -> Result<Option<RoutingRule>> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM routing_rules r WHERE r.id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    pub async fn set_routing_rule_active(&self, id: RuleId, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE routing_rules SET active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CallEngineError::not_found(format!("routing rule {id}")));
        }
        Ok(())
    }

    pub async fn list_routing_rules(&self) -> Result<Vec<RoutingRule>> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM routing_rules r ORDER BY r.priority, r.id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(rule_from_row).collect()
    }

    /// Active rules in evaluation order, with number and group targets that
    /// point at missing or inactive records blanked out.
    pub async fn routable_rules(&self) -> Result<Vec<RoutingRule>> {
        let rows = sqlx::query(
            "SELECT r.id, r.name, r.description, r.priority, r.caller_id_pattern, r.called_number_pattern,
                    r.time_condition, r.action,
                    CASE WHEN tn.active = 1 THEN r.target_number_id END AS target_number_id,
                    CASE WHEN tg.active = 1 THEN r.target_group_id END AS target_group_id,
                    r.target_external, r.announcement_text, r.active
             FROM routing_rules r
             LEFT JOIN internal_numbers tn ON tn.id = r.target_number_id
             LEFT JOIN number_groups tg ON tg.id = r.target_group_id
             WHERE r.active = 1
             ORDER BY r.priority, r.id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    /// Active rules that can never execute because their target is missing.
    pub async fn misconfigured_rules(&self) -> Result<Vec<RoutingRule>> {
        Ok(self
            .routable_rules()
            .await?
            .into_iter()
            .filter(|rule| !rule.is_actionable())
            .collect())
    }
}
