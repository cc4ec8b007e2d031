//! Directory fixtures shared by unit tests.

use crate::database::DatabaseManager;
use crate::directory::{
    Account, CrmUser, DistributionStrategy, Group, InternalNumber, NewAccount, NewGroup, NewInternalNumber,
    NewSipServer, NewUser, SipServer,
};

pub(crate) struct Fixture {
    pub db: DatabaseManager,
    pub server: SipServer,
}

pub(crate) struct Extension {
    pub user: CrmUser,
    pub number: InternalNumber,
    pub account: Account,
}

impl Fixture {
    pub async fn new() -> Self {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let server = db
            .create_sip_server(NewSipServer::new("main", "pbx.test"))
            .await
            .unwrap();
        Self { db, server }
    }

    /// A user with an auto-allocated extension and an active account.
    pub async fn extension(&self, username: &str) -> Extension {
        let user = self
            .db
            .create_user(NewUser::new(username, username).with_email(format!("{username}@crm.test")))
            .await
            .unwrap();
        let number = self
            .db
            .create_internal_number(NewInternalNumber::allocated(self.server.id).for_user(user.id), 1000)
            .await
            .unwrap();
        let account = self
            .db
            .create_account(NewAccount::new(user.id, number.id))
            .await
            .unwrap();
        Extension { user, number, account }
    }

    pub async fn group(
        &self,
        name: &str,
        strategy: DistributionStrategy,
        members: &[&Extension],
        max_queue_size: u32,
        queue_timeout: u32,
    ) -> Group {
        let group = self
            .db
            .create_group(
                NewGroup::new(name, self.server.id)
                    .with_strategy(strategy)
                    .with_queue(max_queue_size, queue_timeout),
            )
            .await
            .unwrap();
        for member in members {
            self.db.add_group_member(group.id, member.number.id).await.unwrap();
        }
        group
    }
}
