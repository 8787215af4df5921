//! Prompt templates for the stage actors.
//!
//! Placeholders are `{{name}}` and are filled by [`render`]. Unknown
//! placeholders are left in place so a missing binding is visible in the
//! prompt rather than silently dropped.

pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Appended to a generation prompt when the reviewer asked for changes.
pub const REVISION: &str = r#"
A previous version was reviewed and needs changes.

<previous>
{{previous}}
</previous>

<feedback>
{{feedback}}
</feedback>

Apply the feedback and return the complete revised output in the same tags."#;

pub const TYPESPEC: &str = r#"Given user application description generate TypeSpec models and interface for the application.

TypeSpec is extended with an @llm_func decorator that defines a single sentence description for the function use scenario.
extern dec llm_func(target: unknown, description: string);

Rules:
- Output contains a single interface.
- Functions in the interface should be decorated with @llm_func decorator.
- Each function should have a single argument "options".
- Data model for the function argument should be simple and easily inferable from chat messages.
- Using reserved keywords for property names, type names, and function names is not allowed.

Date and time types: plainDate, plainTime, utcDateTime, offsetDateTime, duration. There are no other date or time types.
Basic types: numeric, integer, float, decimal, string, boolean, bytes, null, unknown, void. Avoid other types.
Reserved keywords: model, interface. Do not use them as property, type, or function names.

Example input:
<description>
Bot that records my diet and calculates calories.
</description>

Output:
<reasoning>
I expect user to send messages like "I ate a burger" or "I had a salad for lunch".
- recordDish(options: Dish): void;
- listDishes(options: ListDishesRequest): Dish[];
</reasoning>

<typespec>
model Dish {
    name: string;
    ingredients: Ingredient[];
}

model Ingredient {
    name: string;
    calories: integer;
}

model ListDishesRequest {
    from: utcDateTime;
    to: utcDateTime;
}

interface DietBot {
    @llm_func("Record user's dish")
    recordDish(options: Dish): void;
    @llm_func("List user's dishes")
    listDishes(options: ListDishesRequest): Dish[];
}
</typespec>

<description>
{{application_description}}
</description>

Return <reasoning> and TypeSpec definition encompassed with <typespec> tag."#;

pub const TYPESPEC_FIX: &str = r#"Make sure to address following TypeSpec compilation errors:
<errors>
{{errors}}
</errors>

Verify absence of reserved keywords in property names, type names, and function names.
Return <reasoning> and fixed complete TypeSpec definition encompassed with <typespec> tag."#;

pub const DRIZZLE: &str = r#"Based on TypeSpec application definition generate a Drizzle schema for PostgreSQL that stores the application data.

Rules:
- Import column builders from "drizzle-orm/pg-core".
- Export every table as `export const <name>Table = pgTable("<snake_name>", { ... });`.
- Every table has a serial primary key `id` unless the data model clearly dictates another key.
- Use snake_case column names and add `created_at` timestamps where records are created by users.
- Model relations with `.references(() => otherTable.id)`.

<typespec>
{{typespec_definitions}}
</typespec>

Return <reasoning> and the schema encompassed with <drizzle> tag."#;

pub const DRIZZLE_FIX: &str = r#"Make sure to address following Drizzle schema errors:
<errors>
{{errors}}
</errors>

Return <reasoning> and fixed complete Drizzle schema encompassed with <drizzle> tag."#;

pub const TYPESCRIPT: &str = r#"Based on TypeSpec application definition generate TypeScript types with zod schemas and function declarations.

Rules:
- Import zod as `import { z } from "zod";`.
- For every TypeSpec model export a zod schema and an inferred type: `export const dishSchema = z.object({...}); export type Dish = z.infer<typeof dishSchema>;`.
- For every interface function export a declaration: `export declare function recordDish(options: Dish): Promise<void>;`.
- Map utcDateTime, offsetDateTime and plainDate to `z.coerce.date()`.

<typespec>
{{typespec_definitions}}
</typespec>

Return <reasoning> and the TypeScript code encompassed with <typescript> tag."#;

pub const TYPESCRIPT_FIX: &str = r#"Make sure to address following TypeScript compilation errors:
<errors>
{{errors}}
</errors>

Verify absence of reserved keywords in property names, type names, and function names.
Return <reasoning> and fixed complete TypeScript definition encompassed with <typescript> tag."#;

pub const HANDLER_TESTS: &str = r#"Based on TypeScript and Drizzle schemas application definition generate a unit test suite for {{function_name}} function.

<typescript>
{{typescript_schema}}
</typescript>

<drizzle>
{{drizzle_schema}}
</drizzle>

Example output:

<imports>
import { expect, it } from "bun:test";
import { db } from "../../db";
import { greetingRequestsTable } from "../../db/schema/application";
import { type GreetingRequest } from "../../common/schema";
</imports>

<test>
it("should return a greeting", async () => {
  const input: GreetingRequest = { name: "Alice", greeting: "Hello" };
  const greeting = await greet(input);
  expect(greeting).toEqual("Hello, Alice!");
});
</test>

Code style:
1. Always use quotes "" not '' for strings.
2. TypeScript types must be imported using a type-only import since 'verbatimModuleSyntax' is enabled.
3. Use underscored names (i.e. _options) for unused parameters.
4. Never assign null to non-nullable types.

Note on imports:
* Drizzle schema imports must always be from "../../db/schema/application" and use exact table names.
* TypeScript schema imports must always be from "../../common/schema" and use exact type names.
* Drizzle ORM operators come from "drizzle-orm".
* If using db instance, use: import { db } from "../../db";
* Do not import "describe", "beforeEach", "afterEach".
* Do not import the handler itself, it is imported for you.

Return imports within <imports> tag and each test case within its own <test> tag."#;

pub const HANDLER_TESTS_FIX: &str = r#"Make sure to address following TypeScript compilation errors in the test suite:
<errors>
{{errors}}
</errors>

Return fixed <imports> and every <test> again."#;

pub const HANDLER: &str = r#"Based on TypeScript application definition and drizzle schema, generate a handler for {{function_name}} function.
Handler always accepts single argument. It should be declared at the beginning as interface Options.

Example handler implementation:

<handler>
import { db } from "../db";
import { customTable } from "../db/schema/application";

interface Options {
    content: string;
};

export const handle = async (options: Options): Promise<string> => {
    await db.insert(customTable).values({ content: options.content }).execute();
    return options.content;
};
</handler>

Application definitions:

<typespec>
{{typespec_schema}}
</typespec>

<typescript>
{{typescript_schema}}
</typescript>

<drizzle>
{{drizzle_schema}}
</drizzle>

The handler must pass these tests:

<test>
{{test_suite}}
</test>

Handler to implement: {{function_name}}

Generate only:
1. The exported `handle` function with Options and Output types.
2. Required table imports from "../db/schema/application" using exact table names.
3. `import { db } from "../db";` if the database is used.
4. Drizzle ORM operators from "drizzle-orm" if required.
5. Required type-only imports from "../common/schema" using exact type names.

Always use quotes "" not '' for strings.
Return output within <handler> tag."#;

pub const HANDLER_FIX: &str = r#"Make sure to address following errors in the handler:
<errors>
{{errors}}
</errors>

Return fixed complete handler encompassed with <handler> tag."#;

/// Asks for a short kebab-case application name.
pub const APP_NAME: &str = r#"Generate a short name for the application described below. Answer with two to four lowercase words separated by dashes and nothing else.

<description>
{{description}}
</description>"#;

/// Asks for a one-line commit message.
pub const COMMIT_MESSAGE: &str = r#"Write a one-line git commit message (imperative mood, at most 72 characters) for the following change. Answer with the message only.

<description>
{{description}}
</description>

<diff_stat>
{{diff_stat}}
</diff_stat>"#;
